use std::time::Duration;

use log::LevelFilter;

/// Which side of the connection setup a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Dials out; the address names the remote peer.
    Client,
    /// Listens; the address must belong to a local interface.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Software emulation of one-sided RDMA over TCP.
    #[default]
    Tcp,
    /// RNIC via ibverbs. Needs the `verbs` feature.
    Verbs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub log_level: LevelFilter,
    pub backend: BackendKind,
    /// RNIC to open for the verbs backend; the first device when unset.
    pub nic_name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            backend: BackendKind::default(),
            nic_name: None,
        }
    }
}

impl SessionConfig {
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_nic_name(mut self, nic_name: impl Into<String>) -> Self {
        self.nic_name = Some(nic_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Maximum number of operations that may be outstanding at once.
    pub sq_depth: usize,
    pub connect_timeout: Duration,
    /// Reject `FlushType::Persistent` instead of downgrading it when the
    /// peer cannot write directly to persistent memory.
    pub strict_persistence: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            sq_depth: 128,
            connect_timeout: Duration::from_secs(3),
            strict_persistence: false,
        }
    }
}

impl ConnectionConfig {
    pub fn with_sq_depth(mut self, sq_depth: usize) -> Self {
        self.sq_depth = sq_depth;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_strict_persistence(mut self, strict: bool) -> Self {
        self.strict_persistence = strict;
        self
    }
}
