use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use crate::{
    backend::QueuePairChannel,
    completion::Completion,
    config::ConnectionConfig,
    engine::InflightQueue,
    error::{Result, RpmaError},
    handshake::{HANDSHAKE_HEADER_BYTES, HandshakeData, MAX_PRIVATE_DATA},
    peer_cfg::PeerConfig,
    session::{self, Session, SessionInner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Established,
    Disconnecting,
    Closed,
}

/// One reliable connection to a peer.
///
/// Operations are issued and completions consumed through `&mut self`, so a
/// connection has a single logical owner. It may be moved between threads.
pub struct Connection {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) channel: Box<dyn QueuePairChannel>,
    pub(crate) config: ConnectionConfig,
    pub(crate) state: ConnectionState,
    pub(crate) peer_cfg: PeerConfig,
    pub(crate) inflight: InflightQueue,
    pub(crate) ready: VecDeque<Completion>,
    pub(crate) next_wr_id: u64,
    pub(crate) unsignaled_run: usize,
    pub(crate) poisoned: bool,
}

impl Connection {
    pub(crate) fn connect(
        session: &Session,
        address: &str,
        port: u16,
        private_data: Option<&[u8]>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let private_data = private_data.unwrap_or_default();
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(RpmaError::InvalidArgument(
                "private data exceeds the connection request limit",
            ));
        }
        if config.sq_depth == 0 {
            return Err(RpmaError::InvalidArgument("sq_depth must be non-zero"));
        }
        let remote = session::resolve(address, port).ok_or_else(|| {
            RpmaError::Transport(format!("cannot resolve peer address {address}:{port}"))
        })?;
        log::debug!(
            "connection state: peer={remote}, {:?} -> {:?}",
            ConnectionState::Idle,
            ConnectionState::Connecting
        );
        let channel = session
            .inner()
            .backend
            .connect(remote, private_data, &config)
            .inspect_err(|error| {
                log::warn!("connection to {remote} failed: error={error}");
            })?;
        Ok(Self::established(Arc::clone(session.inner()), channel, config))
    }

    pub(crate) fn established(
        session: Arc<SessionInner>,
        channel: Box<dyn QueuePairChannel>,
        config: ConnectionConfig,
    ) -> Self {
        session.connection_opened();
        log::info!(
            "connection established: peer={}, sq_depth={}, private_data_len={}",
            channel.peer_addr(),
            config.sq_depth,
            channel.peer_private_data().len()
        );
        Self {
            session,
            channel,
            config,
            state: ConnectionState::Established,
            peer_cfg: PeerConfig::default(),
            inflight: InflightQueue::default(),
            ready: VecDeque::new(),
            next_wr_id: 1,
            unsignaled_run: 0,
            poisoned: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// True once a completion mismatch or a failed operation was observed;
    /// only teardown is allowed afterwards.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Raw private data the peer sent at connection setup.
    pub fn get_peer_handshake(&self) -> Result<&[u8]> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Connecting
        ) {
            return Err(RpmaError::NotEstablished);
        }
        let bytes = self.channel.peer_private_data();
        if bytes.len() < HANDSHAKE_HEADER_BYTES {
            return Err(RpmaError::PayloadTooShort {
                got: bytes.len(),
                need: HANDSHAKE_HEADER_BYTES,
            });
        }
        Ok(bytes)
    }

    pub fn peer_handshake(&self) -> Result<HandshakeData> {
        HandshakeData::from_bytes(self.get_peer_handshake()?)
    }

    /// Records what the peer advertised about its memory. Flushes consult it.
    pub fn apply_remote_peer_cfg(&mut self, peer_cfg: PeerConfig) {
        log::debug!(
            "peer cfg applied: peer={}, direct_write_to_pmem={}",
            self.channel.peer_addr(),
            peer_cfg.direct_write_to_pmem()
        );
        self.peer_cfg = peer_cfg;
    }

    pub fn peer_cfg(&self) -> PeerConfig {
        self.peer_cfg
    }

    /// Starts an orderly shutdown. Calling it again is a no-op.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnecting | ConnectionState::Closed => Ok(()),
            _ => {
                let peer = self.channel.peer_addr();
                transition(&mut self.state, ConnectionState::Disconnecting, peer);
                self.channel.disconnect()
            }
        }
    }

    /// Blocks until the connection is closed, then discards whatever
    /// completions are left and retires all in-flight operations.
    pub fn wait_closed(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.channel.wait_closed()?;
        self.retire_all();
        let peer = self.channel.peer_addr();
        transition(&mut self.state, ConnectionState::Closed, peer);
        Ok(())
    }

    pub fn disconnect_and_wait(&mut self) -> Result<()> {
        self.disconnect()?;
        self.wait_closed()
    }

    fn retire_all(&mut self) {
        let discarded = self.channel.drain().len();
        let undelivered = self.ready.len();
        self.ready.clear();
        let retired = self.inflight.clear();
        if discarded + undelivered + retired > 0 {
            log::debug!(
                "connection drained: peer={}, discarded_completions={}, retired_ops={retired}",
                self.channel.peer_addr(),
                discarded + undelivered
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            if self.state == ConnectionState::Established {
                log::warn!(
                    "connection dropped while established: peer={}, inflight={}",
                    self.channel.peer_addr(),
                    self.inflight.len()
                );
            }
            self.channel.abort();
            if let Err(error) = self.channel.wait_closed() {
                log::warn!("connection teardown failed: error={error}");
            }
            self.retire_all();
            self.state = ConnectionState::Closed;
        }
        self.session.connection_closed();
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState, peer: SocketAddr) {
    log::debug!("connection state: peer={peer}, {:?} -> {:?}", *state, next);
    *state = next;
}
