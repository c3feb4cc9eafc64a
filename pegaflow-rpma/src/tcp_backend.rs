//! Software transport that emulates one-sided RDMA over TCP.
//!
//! Each connection runs a reader thread, which serves the peer's
//! read/write/flush requests against the local region table and turns acks
//! into completions, and a writer thread fed through a channel so posting
//! never blocks on the socket.

use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering, fence},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    backend::{
        LocalSge, MrKeys, PassiveListener, PendingConnection, QueuePairChannel, RdmaBackend,
        WorkOp, WorkRequest,
    },
    completion::{CompletionQueue, FlushType, OpKind, WcStatus, WorkCompletion},
    config::{ConnectionConfig, PeerRole},
    control_protocol::{ControlMessage, MAX_TRANSFER_BYTES, read_frame, write_frame},
    error::{Result, RpmaError},
    handshake::MAX_PRIVATE_DATA,
    mr::MrUsage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

struct RegionEntry {
    addr: u64,
    len: usize,
    usage: MrUsage,
}

/// Registered regions of one session, addressable by key.
#[derive(Default)]
pub(crate) struct RegionTable {
    next_key: AtomicU32,
    entries: RwLock<HashMap<u32, RegionEntry>>,
}

impl RegionTable {
    fn insert(&self, addr: u64, len: usize, usage: MrUsage) -> u32 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries
            .write()
            .insert(key, RegionEntry { addr, len, usage });
        key
    }

    fn remove(&self, key: u32) -> bool {
        self.entries.write().remove(&key).is_some()
    }

    /// Runs `f` on `[addr, addr + len)` when `key` covers the range and
    /// grants `need`. The table stays read-locked for the duration, so a
    /// concurrent deregistration waits for the access to finish.
    fn with_range<R>(
        &self,
        key: u32,
        addr: u64,
        len: usize,
        need: MrUsage,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Option<R> {
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if !entry.usage.contains(need) {
            return None;
        }
        let end = addr.checked_add(len as u64)?;
        let entry_end = entry.addr.checked_add(entry.len as u64)?;
        if addr < entry.addr || end > entry_end {
            return None;
        }
        Some(f(addr as *mut u8))
    }

    fn copy_out(&self, key: u32, addr: u64, len: usize, need: MrUsage) -> Option<Bytes> {
        self.with_range(key, addr, len, need, |ptr| {
            // SAFETY: the range lies inside a live registration.
            Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(ptr, len) })
        })
    }

    fn copy_in(&self, key: u32, addr: u64, data: &[u8], need: MrUsage) -> Option<()> {
        self.with_range(key, addr, data.len(), need, |ptr| {
            // SAFETY: the range lies inside a live registration.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) }
        })
    }
}

pub(crate) struct TcpBackend {
    local_ip: IpAddr,
    regions: Arc<RegionTable>,
}

impl TcpBackend {
    pub(crate) fn open(address: &str, role: PeerRole) -> Result<Self> {
        let local_ip = (address, 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| RpmaError::DeviceNotFound(address.to_string()))?;

        if role == PeerRole::Server {
            TcpListener::bind((local_ip, 0))
                .map_err(|_| RpmaError::DeviceNotFound(address.to_string()))?;
        }

        log::debug!("tcp device opened: address={address}, ip={local_ip}, role={role:?}");
        Ok(Self {
            local_ip,
            regions: Arc::new(RegionTable::default()),
        })
    }
}

impl RdmaBackend for TcpBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn register_memory(&self, addr: u64, len: usize, usage: MrUsage) -> Result<MrKeys> {
        if addr == 0 || len == 0 {
            return Err(RpmaError::RegistrationDenied(
                "empty memory range".to_string(),
            ));
        }
        let key = self.regions.insert(addr, len, usage);
        Ok(MrKeys {
            lkey: key,
            rkey: key,
        })
    }

    fn deregister_memory(&self, keys: MrKeys) -> Result<()> {
        if !self.regions.remove(keys.lkey) {
            return Err(RpmaError::Backend(format!(
                "unknown memory key {:#x}",
                keys.lkey
            )));
        }
        Ok(())
    }

    fn connect(
        &self,
        remote: SocketAddr,
        private_data: &[u8],
        config: &ConnectionConfig,
    ) -> Result<Box<dyn QueuePairChannel>> {
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(RpmaError::InvalidArgument("private data exceeds 56 bytes"));
        }
        let mut stream =
            TcpStream::connect_timeout(&remote, config.connect_timeout).map_err(|error| {
                match error.kind() {
                    ErrorKind::TimedOut | ErrorKind::WouldBlock => RpmaError::Timeout("connect"),
                    ErrorKind::ConnectionRefused => RpmaError::Rejected(remote.to_string()),
                    _ => RpmaError::Transport(error.to_string()),
                }
            })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.connect_timeout))?;

        write_frame(
            &mut stream,
            &ControlMessage::ConnectReq {
                private_data: Bytes::copy_from_slice(private_data),
                rc: None,
            },
        )?;
        let peer_private_data = match read_frame(&mut stream) {
            Ok(Some(ControlMessage::ConnectResp { private_data, .. })) => private_data,
            Ok(Some(ControlMessage::ConnectReject)) | Ok(None) => {
                return Err(RpmaError::Rejected(remote.to_string()));
            }
            Ok(Some(other)) => {
                return Err(RpmaError::Transport(format!(
                    "unexpected connect response: {}",
                    other.kind()
                )));
            }
            Err(error) if matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(RpmaError::Timeout("connect response"));
            }
            Err(error) => return Err(error.into()),
        };
        stream.set_read_timeout(None)?;

        log::info!("tcp connection established: peer={remote}");
        let channel = TcpChannel::start(stream, remote, peer_private_data, &self.regions)?;
        Ok(Box::new(channel))
    }

    fn listen(&self, local: SocketAddr) -> Result<Box<dyn PassiveListener>> {
        // The listener always lives on the device address.
        let listener = TcpListener::bind(SocketAddr::new(self.local_ip, local.port()))?;
        let local_addr = listener.local_addr()?;
        log::info!("tcp endpoint listening: addr={local_addr}");
        Ok(Box::new(TcpPassiveListener {
            listener,
            local_addr,
            regions: Arc::clone(&self.regions),
        }))
    }
}

struct TcpPassiveListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    regions: Arc<RegionTable>,
}

impl PassiveListener for TcpPassiveListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn next_request(&self) -> Result<Box<dyn PendingConnection>> {
        loop {
            let (mut stream, peer_addr) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
            match read_frame(&mut stream) {
                Ok(Some(ControlMessage::ConnectReq { private_data, .. })) => {
                    log::debug!("connection request: peer={peer_addr}, pdata_len={}", private_data.len());
                    return Ok(Box::new(TcpPendingConnection {
                        stream: Some(stream),
                        peer_addr,
                        peer_private_data: private_data,
                        regions: Arc::clone(&self.regions),
                    }));
                }
                Ok(other) => {
                    log::warn!(
                        "dropping connection without a connect request: peer={peer_addr}, first={:?}",
                        other.as_ref().map(ControlMessage::kind)
                    );
                }
                Err(error) => {
                    log::warn!("failed to read connect request: peer={peer_addr}, error={error}");
                }
            }
        }
    }
}

struct TcpPendingConnection {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
    peer_private_data: Bytes,
    regions: Arc<RegionTable>,
}

impl PendingConnection for TcpPendingConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn peer_private_data(&self) -> &[u8] {
        &self.peer_private_data
    }

    fn accept(
        mut self: Box<Self>,
        private_data: &[u8],
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn QueuePairChannel>> {
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(RpmaError::InvalidArgument("private data exceeds 56 bytes"));
        }
        let mut stream = self.stream.take().ok_or(RpmaError::NotEstablished)?;
        write_frame(
            &mut stream,
            &ControlMessage::ConnectResp {
                private_data: Bytes::copy_from_slice(private_data),
                rc: None,
            },
        )?;
        stream.set_read_timeout(None)?;
        log::info!("tcp connection accepted: peer={}", self.peer_addr);
        let peer_private_data = std::mem::take(&mut self.peer_private_data);
        let channel = TcpChannel::start(stream, self.peer_addr, peer_private_data, &self.regions)?;
        Ok(Box::new(channel))
    }

    fn reject(mut self: Box<Self>) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            write_frame(&mut stream, &ControlMessage::ConnectReject)?;
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

impl Drop for TcpPendingConnection {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = write_frame(&mut stream, &ControlMessage::ConnectReject);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct PendingOp {
    op: OpKind,
    signaled: bool,
    read_into: Option<(LocalSge, u32)>,
}

#[derive(Default)]
struct LinkState {
    local_disconnect: bool,
    peer_disconnect: bool,
    closed: bool,
}

struct ChannelShared {
    regions: Arc<RegionTable>,
    cq: CompletionQueue,
    pending: Mutex<BTreeMap<u64, PendingOp>>,
    outbound: Mutex<Option<Sender<ControlMessage>>>,
    link: Mutex<LinkState>,
    closed_cv: Condvar,
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl ChannelShared {
    fn send(&self, message: ControlMessage) -> Result<()> {
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(RpmaError::ConnectionLost)?;
        sender.send(message).map_err(|_| RpmaError::ConnectionLost)
    }

    fn serve_write(&self, seq: u64, rkey: u32, addr: u64, payload: &[u8]) {
        let status = self
            .regions
            .copy_in(rkey, addr, payload, MrUsage::WRITE_DST)
            .map_or(WcStatus::RemoteAccess, |()| WcStatus::Success);
        self.reply(seq, status, Bytes::new());
    }

    fn serve_read(&self, seq: u64, rkey: u32, addr: u64, len: u32) {
        match self
            .regions
            .copy_out(rkey, addr, len as usize, MrUsage::READ_SRC)
        {
            Some(payload) => self.reply(seq, WcStatus::Success, payload),
            None => self.reply(seq, WcStatus::RemoteAccess, Bytes::new()),
        }
    }

    fn serve_flush(&self, seq: u64, rkey: u32, addr: u64, len: u64, persistent: bool) {
        let covered = usize::try_from(len).ok().and_then(|len| {
            self.regions
                .with_range(rkey, addr, len, MrUsage::WRITE_DST, |_| ())
        });
        let status = match covered {
            Some(()) => {
                // Earlier writes on this stream were applied before this
                // frame was read; the fence publishes them.
                fence(Ordering::SeqCst);
                log::trace!("flush served: seq={seq}, addr={addr:#x}, len={len}, persistent={persistent}");
                WcStatus::Success
            }
            None => WcStatus::RemoteAccess,
        };
        self.reply(seq, status, Bytes::new());
    }

    fn reply(&self, seq: u64, status: WcStatus, payload: Bytes) {
        if let Err(error) = self.send(ControlMessage::Ack {
            seq,
            status,
            payload,
        }) {
            log::debug!("dropping ack for seq={seq}: {error}");
        }
    }

    fn complete(&self, seq: u64, status: WcStatus, payload: &[u8]) {
        let Some(pending) = self.pending.lock().remove(&seq) else {
            log::warn!("ack for unknown request: peer={}, seq={seq}", self.peer_addr);
            return;
        };
        let status = match pending.read_into {
            Some((local, len)) if status == WcStatus::Success => {
                if payload.len() != len as usize {
                    WcStatus::LocalLength
                } else {
                    self.regions
                        .copy_in(local.lkey, local.addr, payload, MrUsage::READ_DST)
                        .map_or(WcStatus::LocalProtection, |()| WcStatus::Success)
                }
            }
            _ => status,
        };
        if status != WcStatus::Success || pending.signaled {
            self.cq.push(WorkCompletion {
                wr_id: seq,
                op: pending.op,
                status,
            });
        }
    }

    fn on_peer_disconnect(&self) {
        let reply = {
            let mut link = self.link.lock();
            link.peer_disconnect = true;
            !std::mem::replace(&mut link.local_disconnect, true)
        };
        log::debug!("peer disconnected: peer={}", self.peer_addr);
        if reply {
            let _ = self.send(ControlMessage::Disconnect);
        }
    }

    fn on_closed(&self) {
        // Posting checks `outbound` and records the op under the same lock,
        // so nothing is added to `pending` once the sender is gone.
        self.outbound.lock().take();
        let flushed: Vec<(u64, PendingOp)> =
            std::mem::take(&mut *self.pending.lock()).into_iter().collect();
        for (seq, pending) in flushed {
            self.cq.push(WorkCompletion {
                wr_id: seq,
                op: pending.op,
                status: WcStatus::WrFlushed,
            });
        }
        self.cq.close();
        let _ = self.stream.shutdown(Shutdown::Both);

        let mut link = self.link.lock();
        link.closed = true;
        self.closed_cv.notify_all();
        log::info!("tcp connection closed: peer={}", self.peer_addr);
    }
}

pub(crate) struct TcpChannel {
    shared: Arc<ChannelShared>,
    peer_private_data: Bytes,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpChannel {
    fn start(
        stream: TcpStream,
        peer_addr: SocketAddr,
        peer_private_data: Bytes,
        regions: &Arc<RegionTable>,
    ) -> Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let (tx, rx) = channel::unbounded();

        let shared = Arc::new(ChannelShared {
            regions: Arc::clone(regions),
            cq: CompletionQueue::new(),
            pending: Mutex::new(BTreeMap::new()),
            outbound: Mutex::new(Some(tx)),
            link: Mutex::new(LinkState::default()),
            closed_cv: Condvar::new(),
            stream,
            peer_addr,
        });

        let writer_handle = thread::Builder::new()
            .name("pegaflow-rpma-tx".to_string())
            .spawn(move || Self::writer_loop(writer, rx, peer_addr))
            .map_err(|error| RpmaError::Backend(error.to_string()))?;
        let reader_shared = Arc::clone(&shared);
        let reader_handle = thread::Builder::new()
            .name("pegaflow-rpma-rx".to_string())
            .spawn(move || Self::reader_loop(reader, reader_shared))
            .map_err(|error| RpmaError::Backend(error.to_string()))?;

        Ok(Self {
            shared,
            peer_private_data,
            threads: Mutex::new(vec![writer_handle, reader_handle]),
        })
    }

    fn writer_loop(mut stream: TcpStream, rx: Receiver<ControlMessage>, peer_addr: SocketAddr) {
        for message in rx {
            if let Err(error) = write_frame(&mut stream, &message) {
                // The reader sees the shutdown and flushes whatever is pending.
                log::warn!("tcp writer stopped: peer={peer_addr}, error={error}");
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            if message == ControlMessage::Disconnect {
                let _ = stream.shutdown(Shutdown::Write);
                return;
            }
        }
    }

    fn reader_loop(mut stream: TcpStream, shared: Arc<ChannelShared>) {
        loop {
            let message = match read_frame(&mut stream) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(error) => {
                    log::debug!("tcp reader stopped: peer={}, error={error}", shared.peer_addr);
                    break;
                }
            };
            match message {
                ControlMessage::Write {
                    seq,
                    rkey,
                    addr,
                    payload,
                } => shared.serve_write(seq, rkey, addr, &payload),
                ControlMessage::Read {
                    seq,
                    rkey,
                    addr,
                    len,
                } => shared.serve_read(seq, rkey, addr, len),
                ControlMessage::Flush {
                    seq,
                    rkey,
                    addr,
                    len,
                    persistent,
                } => shared.serve_flush(seq, rkey, addr, len, persistent),
                ControlMessage::Ack {
                    seq,
                    status,
                    payload,
                } => shared.complete(seq, status, &payload),
                ControlMessage::Disconnect => shared.on_peer_disconnect(),
                other => {
                    log::warn!(
                        "protocol violation: peer={}, unexpected {}",
                        shared.peer_addr,
                        other.kind()
                    );
                    break;
                }
            }
        }
        shared.on_closed();
    }

    fn request_for(&self, wr: &WorkRequest) -> Result<(ControlMessage, Option<(LocalSge, u32)>)> {
        let seq = wr.wr_id;
        match wr.op {
            WorkOp::Write { local, remote, len } => {
                let payload = self
                    .shared
                    .regions
                    .copy_out(local.lkey, local.addr, len as usize, MrUsage::WRITE_SRC)
                    .ok_or(RpmaError::UsageMismatch("write from an unregistered range"))?;
                Ok((
                    ControlMessage::Write {
                        seq,
                        rkey: remote.rkey,
                        addr: remote.addr,
                        payload,
                    },
                    None,
                ))
            }
            WorkOp::Read { local, remote, len } => Ok((
                ControlMessage::Read {
                    seq,
                    rkey: remote.rkey,
                    addr: remote.addr,
                    len,
                },
                Some((local, len)),
            )),
            WorkOp::Flush {
                remote,
                len,
                flush_type,
            } => Ok((
                ControlMessage::Flush {
                    seq,
                    rkey: remote.rkey,
                    addr: remote.addr,
                    len,
                    persistent: flush_type == FlushType::Persistent,
                },
                None,
            )),
        }
    }
}

impl QueuePairChannel for TcpChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    fn peer_private_data(&self) -> &[u8] {
        &self.peer_private_data
    }

    fn post(&self, wr: WorkRequest) -> Result<()> {
        {
            let link = self.shared.link.lock();
            if link.closed || link.local_disconnect {
                return Err(RpmaError::ConnectionLost);
            }
        }
        let (message, read_into) = self.request_for(&wr)?;
        let outbound = self.shared.outbound.lock();
        let sender = outbound.as_ref().ok_or(RpmaError::ConnectionLost)?;
        self.shared.pending.lock().insert(
            wr.wr_id,
            PendingOp {
                op: wr.op.kind(),
                signaled: wr.signaled,
                read_into,
            },
        );
        if sender.send(message).is_err() {
            self.shared.pending.lock().remove(&wr.wr_id);
            return Err(RpmaError::ConnectionLost);
        }
        Ok(())
    }

    fn max_transfer_len(&self) -> u32 {
        MAX_TRANSFER_BYTES
    }

    fn poll(&self) -> Option<WorkCompletion> {
        self.shared.cq.poll()
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        self.shared.cq.wait(deadline)
    }

    fn drain(&self) -> Vec<WorkCompletion> {
        self.shared.cq.drain()
    }

    fn disconnect(&self) -> Result<()> {
        {
            let mut link = self.shared.link.lock();
            if link.closed {
                return Ok(());
            }
            if std::mem::replace(&mut link.local_disconnect, true) {
                return Ok(());
            }
        }
        log::debug!("disconnecting: peer={}", self.shared.peer_addr);
        self.shared.send(ControlMessage::Disconnect)
    }

    fn abort(&self) {
        self.shared.link.lock().local_disconnect = true;
        let _ = self.shared.stream.shutdown(Shutdown::Both);
    }

    fn wait_closed(&self) -> Result<()> {
        let mut link = self.shared.link.lock();
        while !link.closed {
            self.shared.closed_cv.wait(&mut link);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.cq.is_closed()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.abort();
        }
        let _ = self.wait_closed();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, TcpListener, TcpStream},
        thread,
    };

    use bytes::Bytes;
    use crossbeam::channel;

    use super::{RegionTable, TcpBackend, TcpChannel};
    use crate::{
        backend::{QueuePairChannel, RdmaBackend, RemoteSge, WorkOp, WorkRequest},
        completion::FlushType,
        config::{ConnectionConfig, PeerRole},
        control_protocol::{ControlMessage, MAX_FRAME_BYTES, read_frame},
        error::RpmaError,
        mr::MrUsage,
    };

    #[test]
    fn open_rejects_unresolvable_address() {
        let err = TcpBackend::open("definitely not an address", PeerRole::Client)
            .err()
            .expect("must fail");
        assert!(matches!(err, RpmaError::DeviceNotFound(_)));
    }

    #[test]
    fn open_server_on_loopback() {
        let backend = TcpBackend::open("127.0.0.1", PeerRole::Server).expect("loopback");
        assert!(backend.local_ip.is_loopback());
    }

    #[test]
    fn region_table_enforces_bounds_and_usage() {
        let mut storage = vec![0_u8; 64];
        let base = storage.as_mut_ptr() as u64;
        let table = RegionTable::default();
        let key = table.insert(base, storage.len(), MrUsage::WRITE_DST);

        assert!(table.copy_in(key, base + 60, b"abcd", MrUsage::WRITE_DST).is_some());
        assert!(table.copy_in(key, base + 61, b"abcd", MrUsage::WRITE_DST).is_none());
        assert!(table.copy_in(key, base - 1, b"a", MrUsage::WRITE_DST).is_none());
        assert!(table.copy_out(key, base, 4, MrUsage::READ_SRC).is_none());
        assert!(table.copy_in(key + 1, base, b"a", MrUsage::WRITE_DST).is_none());
        assert_eq!(&storage[60..], b"abcd");

        assert!(table.remove(key));
        assert!(table.copy_in(key, base, b"a", MrUsage::WRITE_DST).is_none());
    }

    #[test]
    fn writer_failure_shuts_the_socket_down() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");

        let (tx, rx) = channel::unbounded();
        tx.send(ControlMessage::Write {
            seq: 1,
            rkey: 1,
            addr: 0,
            payload: Bytes::from(vec![0_u8; MAX_FRAME_BYTES]),
        })
        .expect("queue");
        TcpChannel::writer_loop(client, rx, addr);

        assert_eq!(read_frame(&mut server).expect("clean eof"), None);
    }

    #[test]
    fn post_after_close_queues_no_completion() {
        let backend = TcpBackend::open("127.0.0.1", PeerRole::Server).expect("loopback");
        let listener = backend
            .listen(SocketAddr::new(backend.local_ip, 0))
            .expect("listen");
        let remote = listener.local_addr();
        let server = thread::spawn(move || {
            listener
                .next_request()
                .expect("request")
                .accept(&[], &ConnectionConfig::default())
                .expect("accept")
        });
        let client = backend
            .connect(remote, &[], &ConnectionConfig::default())
            .expect("connect");
        drop(server.join().expect("server thread"));
        client.wait_closed().expect("closed");

        let err = client
            .post(WorkRequest {
                wr_id: 7,
                op: WorkOp::Flush {
                    remote: RemoteSge { rkey: 1, addr: 0 },
                    len: 8,
                    flush_type: FlushType::Visibility,
                },
                signaled: true,
            })
            .expect_err("closed channel");
        assert_eq!(err, RpmaError::ConnectionLost);
        assert!(client.poll().is_none());
    }
}
