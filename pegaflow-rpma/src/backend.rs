use std::{net::SocketAddr, sync::Arc, time::Instant};

use crate::{
    completion::{FlushType, OpKind, WorkCompletion},
    config::{BackendKind, ConnectionConfig, PeerRole, SessionConfig},
    error::{Result, RpmaError},
    mr::MrUsage,
    tcp_backend::TcpBackend,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MrKeys {
    pub(crate) lkey: u32,
    pub(crate) rkey: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LocalSge {
    pub(crate) lkey: u32,
    pub(crate) addr: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RemoteSge {
    pub(crate) rkey: u32,
    pub(crate) addr: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkOp {
    Read {
        local: LocalSge,
        remote: RemoteSge,
        len: u32,
    },
    Write {
        local: LocalSge,
        remote: RemoteSge,
        len: u32,
    },
    Flush {
        remote: RemoteSge,
        len: u64,
        flush_type: FlushType,
    },
}

impl WorkOp {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            WorkOp::Read { .. } => OpKind::Read,
            WorkOp::Write { .. } => OpKind::Write,
            WorkOp::Flush { .. } => OpKind::Flush,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WorkRequest {
    pub(crate) wr_id: u64,
    pub(crate) op: WorkOp,
    pub(crate) signaled: bool,
}

/// Device-level half of a transport: memory registration and connection
/// setup.
pub(crate) trait RdmaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn register_memory(&self, addr: u64, len: usize, usage: MrUsage) -> Result<MrKeys>;
    fn deregister_memory(&self, keys: MrKeys) -> Result<()>;

    fn connect(
        &self,
        _remote: SocketAddr,
        _private_data: &[u8],
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn QueuePairChannel>> {
        Err(RpmaError::Backend(format!(
            "{} backend cannot initiate connections",
            self.name()
        )))
    }

    fn listen(&self, _local: SocketAddr) -> Result<Box<dyn PassiveListener>> {
        Err(RpmaError::Backend(format!(
            "{} backend cannot accept connections",
            self.name()
        )))
    }
}

pub(crate) trait PassiveListener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;
    fn next_request(&self) -> Result<Box<dyn PendingConnection>>;
}

/// An incoming connection request not yet answered.
pub(crate) trait PendingConnection: Send {
    fn peer_addr(&self) -> SocketAddr;
    fn peer_private_data(&self) -> &[u8];
    fn accept(
        self: Box<Self>,
        private_data: &[u8],
        config: &ConnectionConfig,
    ) -> Result<Box<dyn QueuePairChannel>>;
    fn reject(self: Box<Self>) -> Result<()>;
}

/// Connection-level half of a transport: a queue pair and its completion
/// stream.
pub(crate) trait QueuePairChannel: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;
    fn peer_private_data(&self) -> &[u8];

    fn post(&self, wr: WorkRequest) -> Result<()>;
    /// Largest read or write a single work request may carry.
    fn max_transfer_len(&self) -> u32 {
        u32::MAX
    }
    fn poll(&self) -> Option<WorkCompletion>;
    fn wait(&self, deadline: Option<Instant>) -> Result<()>;
    /// Discards every queued completion.
    fn drain(&self) -> Vec<WorkCompletion>;

    fn disconnect(&self) -> Result<()>;
    /// Tears the channel down without waiting for the peer.
    fn abort(&self);
    fn wait_closed(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

pub(crate) fn open_backend(
    config: &SessionConfig,
    address: &str,
    role: PeerRole,
) -> Result<Arc<dyn RdmaBackend>> {
    match config.backend {
        BackendKind::Tcp => Ok(Arc::new(TcpBackend::open(address, role)?)),
        #[cfg(feature = "verbs")]
        BackendKind::Verbs => Ok(Arc::new(crate::sideway_backend::SidewayBackend::open(
            config, address, role,
        )?)),
        #[cfg(not(feature = "verbs"))]
        BackendKind::Verbs => Err(RpmaError::DeviceNotFound(format!(
            "{address} (built without the `verbs` feature)"
        ))),
    }
}
