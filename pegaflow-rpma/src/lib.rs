//! One-sided RDMA sessions with flush-to-persistence.
//!
//! A [`Session`] owns a device context; [`Connection`]s opened from it post
//! reads, writes and flushes against a peer's exported memory region and
//! report their outcome through completions.

mod backend;
mod completion;
mod config;
mod connection;
mod control_protocol;
mod engine;
mod error;
mod handshake;
mod logging;
mod mr;
mod peer_cfg;
mod session;
#[cfg(feature = "verbs")]
mod sideway_backend;
mod tcp_backend;

pub use completion::{Completion, CompletionPolicy, CompletionStatus, FlushType, OpKind, WcStatus};
pub use config::{BackendKind, ConnectionConfig, PeerRole, SessionConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{Result, RpmaError};
pub use handshake::{
    DESCRIPTORS_MAX_SIZE, HANDSHAKE_HEADER_BYTES, HandshakeData, MAX_PRIVATE_DATA, decode,
    encode,
};
pub use mr::{AlignedBuffer, LocalMr, MR_DESCRIPTOR_BYTES, MrUsage, PAGE_SIZE, RemoteMr, import_descriptor};
pub use peer_cfg::{PEER_CFG_DESCRIPTOR_BYTES, PeerConfig};
pub use session::{ConnectionRequest, Endpoint, Session};

/// Initializes logging at `level` unless it is already set up.
pub fn init_logging(level: log::LevelFilter) {
    logging::ensure_initialized(level);
}
