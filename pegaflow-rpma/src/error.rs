use thiserror::Error;

use crate::completion::{OpKind, WcStatus};

pub type Result<T> = std::result::Result<T, RpmaError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpmaError {
    #[error("rdma device not found for address: {0}")]
    DeviceNotFound(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("connection rejected by {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection is not established")]
    NotEstablished,
    #[error("peer private data too short: got {got} bytes, need at least {need}")]
    PayloadTooShort { got: usize, need: usize },
    #[error("handshake truncated: declared {declared} descriptor bytes, received {available}")]
    Truncated { declared: usize, available: usize },
    #[error("malformed descriptor: {0}")]
    Malformed(&'static str),
    #[error("descriptors too large: {len} bytes, max {max}")]
    DescriptorsTooLarge { len: usize, max: usize },
    #[error("memory registration denied: {0}")]
    RegistrationDenied(String),
    #[error("memory region still referenced by {inflight} in-flight operation(s)")]
    RegionBusy { inflight: usize },
    #[error("invalid length: len={len} exceeds available={available}")]
    InvalidLength { len: usize, available: u64 },
    #[error("memory region usage does not permit {0}")]
    UsageMismatch(&'static str),
    #[error("send queue full: depth={depth}")]
    QueueFull { depth: usize },
    #[error("no completion available")]
    NoneAvailable,
    #[error("connection lost")]
    ConnectionLost,
    #[error("unexpected completion: expected {expected}, got {got}")]
    UnexpectedCompletion { expected: String, got: String },
    #[error("{op} failed: {status}")]
    OperationFailed { op: OpKind, status: WcStatus },
    #[error("peer does not support direct write to persistent memory")]
    PersistenceUnsupported,
    #[error("connection poisoned by an earlier fatal completion error")]
    Poisoned,
    #[error("session still has {connections} open connection(s)")]
    SessionBusy { connections: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
}

impl RpmaError {
    /// Errors after which no further operation may be issued on the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpmaError::ConnectionLost
                | RpmaError::UnexpectedCompletion { .. }
                | RpmaError::OperationFailed { .. }
                | RpmaError::Poisoned
        )
    }
}

impl From<std::io::Error> for RpmaError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionRefused => RpmaError::Rejected(error.to_string()),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => RpmaError::Timeout("socket i/o"),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => RpmaError::ConnectionLost,
            _ => RpmaError::Transport(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RpmaError;
    use std::io;

    #[test]
    fn io_errors_map_to_taxonomy() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(RpmaError::from(refused), RpmaError::Rejected(_)));

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(RpmaError::from(eof), RpmaError::ConnectionLost);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(RpmaError::from(timeout), RpmaError::Timeout("socket i/o"));
    }

    #[test]
    fn fatal_classification() {
        assert!(RpmaError::ConnectionLost.is_fatal());
        assert!(RpmaError::Poisoned.is_fatal());
        assert!(!RpmaError::QueueFull { depth: 4 }.is_fatal());
        assert!(!RpmaError::InvalidLength { len: 2, available: 1 }.is_fatal());
    }
}
