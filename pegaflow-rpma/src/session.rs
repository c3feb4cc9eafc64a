use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    backend::{self, PassiveListener, PendingConnection, RdmaBackend},
    config::{ConnectionConfig, PeerRole, SessionConfig},
    connection::Connection,
    error::{Result, RpmaError},
    logging,
    mr::{AlignedBuffer, LocalMr, MrUsage},
};

pub(crate) struct SessionInner {
    pub(crate) backend: Arc<dyn RdmaBackend>,
    address: String,
    ip: IpAddr,
    role: PeerRole,
    live_connections: AtomicUsize,
}

impl SessionInner {
    pub(crate) fn connection_opened(&self) {
        self.live_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        self.live_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A network context bound to one local or remote address.
///
/// Memory is registered and connections are opened through the session;
/// connections keep the context alive until they are dropped.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn open(address: &str, role: PeerRole, config: SessionConfig) -> Result<Self> {
        logging::ensure_initialized(config.log_level);
        if address.trim().is_empty() {
            return Err(RpmaError::InvalidArgument("address is empty"));
        }
        let ip = resolve(address, 0)
            .map(|addr| addr.ip())
            .ok_or_else(|| RpmaError::DeviceNotFound(address.to_string()))?;
        let backend = backend::open_backend(&config, address, role)?;
        log::info!(
            "session opened: address={address}, role={role:?}, backend={}",
            backend.name()
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                backend,
                address: address.to_string(),
                ip,
                role,
                live_connections: AtomicUsize::new(0),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::Acquire)
    }

    pub fn register(&self, buffer: AlignedBuffer, usage: MrUsage) -> Result<LocalMr> {
        LocalMr::register(Arc::clone(&self.inner.backend), buffer, usage)
    }

    pub fn connect(
        &self,
        address: &str,
        port: u16,
        private_data: Option<&[u8]>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        Connection::connect(self, address, port, private_data, config)
    }

    /// Starts listening on the session address. Port 0 picks a free port.
    pub fn listen(&self, port: u16) -> Result<Endpoint> {
        let listener = self
            .inner
            .backend
            .listen(SocketAddr::new(self.inner.ip, port))?;
        Ok(Endpoint {
            session: Arc::clone(&self.inner),
            listener,
        })
    }

    /// Releases the device context. Every connection must be closed first.
    pub fn close(self) -> Result<()> {
        let connections = self.open_connections();
        if connections > 0 {
            log::error!(
                "cannot close session with open connections: address={}, connections={connections}",
                self.inner.address
            );
            return Err(RpmaError::SessionBusy { connections });
        }
        log::info!("session closed: address={}", self.inner.address);
        Ok(())
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

pub(crate) fn resolve(address: &str, port: u16) -> Option<SocketAddr> {
    (address, port).to_socket_addrs().ok()?.next()
}

/// Passive side: accepts incoming connection requests.
pub struct Endpoint {
    session: Arc<SessionInner>,
    listener: Box<dyn PassiveListener>,
}

impl Endpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Blocks until a peer asks to connect.
    pub fn next_request(&self) -> Result<ConnectionRequest> {
        let pending = self.listener.next_request()?;
        Ok(ConnectionRequest {
            session: Arc::clone(&self.session),
            pending,
        })
    }

    /// Accepts the next incoming connection, answering with `private_data`.
    pub fn accept(
        &self,
        private_data: Option<&[u8]>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        self.next_request()?.accept(private_data, config)
    }
}

/// A connection request that has not been answered yet. Dropping it rejects
/// the peer.
pub struct ConnectionRequest {
    session: Arc<SessionInner>,
    pending: Box<dyn PendingConnection>,
}

impl ConnectionRequest {
    pub fn peer_addr(&self) -> SocketAddr {
        self.pending.peer_addr()
    }

    pub fn peer_private_data(&self) -> &[u8] {
        self.pending.peer_private_data()
    }

    pub fn accept(
        self,
        private_data: Option<&[u8]>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let channel = self
            .pending
            .accept(private_data.unwrap_or_default(), &config)?;
        Ok(Connection::established(self.session, channel, config))
    }

    pub fn reject(self) -> Result<()> {
        log::info!("rejecting connection request: peer={}", self.pending.peer_addr());
        self.pending.reject()
    }
}
