//! Verbs transport on a real RNIC.
//!
//! Queue pairs are reliable connections. Peers exchange their RC endpoint
//! and the connection private data over a TCP side channel, which also
//! carries the disconnect notice. A flush is an 8-byte RDMA read of the
//! flushed region: on a peer that writes directly to pmem the read cannot
//! complete before earlier writes are persistent.

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, ErrorKind},
    mem::MaybeUninit,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rdma_mummy_sys::{ibv_port_attr, ibv_query_port};
use sideway::ibverbs::{
    AccessFlags,
    address::{AddressHandleAttribute, Gid},
    completion::{GenericCompletionQueue, PollCompletionQueueError},
    device::DeviceList,
    device_context::{DeviceContext, Mtu, PortState},
    memory_region::MemoryRegion,
    protection_domain::ProtectionDomain,
    queue_pair::{
        GenericQueuePair, PostSendGuard, QueuePair, QueuePairAttribute, QueuePairState,
        QueuePairType, SetScatterGatherEntry, WorkRequestFlags,
    },
};

use crate::{
    backend::{
        MrKeys, PassiveListener, PendingConnection, QueuePairChannel, RdmaBackend, WorkOp,
        WorkRequest,
    },
    completion::{CompletionQueue, OpKind, WcStatus, WorkCompletion},
    config::{ConnectionConfig, PeerRole, SessionConfig},
    control_protocol::{ControlMessage, RcEndpoint, read_frame, write_frame},
    error::{Result, RpmaError},
    handshake::MAX_PRIVATE_DATA,
    mr::MrUsage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_micros(50);
/// How long an errored queue pair may stay silent before the remaining
/// unsignaled work requests are reported as flushed.
const CLOSE_GRACE: Duration = Duration::from_millis(200);
const FLUSH_READ_BYTES: u64 = 8;

static NEXT_PSN: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy)]
struct PortInfo {
    port_num: u8,
    gid_index: u8,
    mtu: Mtu,
    gid: [u8; 16],
    lid: u16,
}

struct VerbsDevice {
    context: Arc<DeviceContext>,
    pd: Arc<ProtectionDomain>,
    port: PortInfo,
    regions: Mutex<HashMap<u32, Arc<MemoryRegion>>>,
}

struct QpParts {
    qp: GenericQueuePair,
    send_cq: GenericCompletionQueue,
    recv_cq: GenericCompletionQueue,
    local_rc: RcEndpoint,
}

impl VerbsDevice {
    fn choose_port_and_gid(context: &Arc<DeviceContext>) -> Result<PortInfo> {
        let dev_attr = context
            .query_device()
            .map_err(|error| RpmaError::Backend(error.to_string()))?;
        let gid_entries = context
            .query_gid_table()
            .map_err(|error| RpmaError::Backend(error.to_string()))?;

        for port_num in 1..=dev_attr.phys_port_cnt() {
            let port_attr = context
                .query_port(port_num)
                .map_err(|error| RpmaError::Backend(error.to_string()))?;
            if port_attr.port_state() != PortState::Active {
                continue;
            }

            // Prefer a routable GID; fall back to link-local.
            let mut picked: Option<(u8, Gid)> = None;
            for entry in gid_entries
                .iter()
                .filter(|entry| entry.port_num() == port_num as u32)
            {
                let gid = entry.gid();
                if gid.is_zero() {
                    continue;
                }
                if !gid.is_unicast_link_local() {
                    picked = Some((entry.gid_index() as u8, gid));
                    break;
                }
                if picked.is_none() {
                    picked = Some((entry.gid_index() as u8, gid));
                }
            }
            let (gid_index, gid) = match picked {
                Some(picked) => picked,
                None => {
                    let gid = context
                        .query_gid(port_num, 0)
                        .map_err(|error| RpmaError::Backend(error.to_string()))?;
                    (0, gid)
                }
            };

            let mut raw_port = unsafe { MaybeUninit::<ibv_port_attr>::zeroed().assume_init() };
            let ret =
                unsafe { ibv_query_port(context.context().as_ptr(), port_num, &raw mut raw_port) };
            if ret != 0 {
                return Err(RpmaError::Backend(format!(
                    "query raw port attr failed: {}",
                    io::Error::from_raw_os_error(ret)
                )));
            }

            return Ok(PortInfo {
                port_num,
                gid_index,
                mtu: port_attr.active_mtu(),
                gid: gid.raw,
                lid: raw_port.lid,
            });
        }

        Err(RpmaError::DeviceNotFound(
            "no active port on selected NIC".to_string(),
        ))
    }

    fn create_qp(&self, sq_depth: usize) -> Result<QpParts> {
        let mut cq_builder = self.context.create_cq_builder();
        cq_builder.setup_cqe(sq_depth as u32);
        let send_cq: GenericCompletionQueue = cq_builder
            .build()
            .map_err(|error| RpmaError::Backend(error.to_string()))?
            .into();
        let recv_cq: GenericCompletionQueue = cq_builder
            .build()
            .map_err(|error| RpmaError::Backend(error.to_string()))?
            .into();

        let mut qp_builder = self.pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::ReliableConnection)
            .setup_send_cq(send_cq.clone())
            .setup_recv_cq(recv_cq.clone())
            .setup_max_send_wr(sq_depth as u32)
            .setup_max_recv_wr(1)
            .setup_max_send_sge(1)
            .setup_max_recv_sge(1);
        let mut qp: GenericQueuePair = qp_builder
            .build()
            .map_err(|error| RpmaError::Backend(error.to_string()))?
            .into();

        let mut init_attr = QueuePairAttribute::new();
        init_attr
            .setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(self.port.port_num)
            .setup_access_flags(
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
            );
        qp.modify(&init_attr)
            .map_err(|error| RpmaError::Backend(error.to_string()))?;

        let seed = NEXT_PSN.fetch_add(1, Ordering::Relaxed);
        let local_rc = RcEndpoint {
            gid: self.port.gid,
            lid: self.port.lid,
            qp_num: qp.qp_number(),
            psn: (qp.qp_number() ^ seed.wrapping_mul(0x9e37)) & 0x00ff_ffff,
        };
        Ok(QpParts {
            qp,
            send_cq,
            recv_cq,
            local_rc,
        })
    }

    fn connect_qp(&self, parts: &mut QpParts, remote_rc: RcEndpoint) -> Result<()> {
        let mut ah_attr = AddressHandleAttribute::new();
        ah_attr
            .setup_dest_lid(remote_rc.lid)
            .setup_port(self.port.port_num)
            .setup_grh_dest_gid(&Gid { raw: remote_rc.gid })
            .setup_grh_src_gid_index(self.port.gid_index)
            .setup_grh_hop_limit(64);

        let mut rtr_attr = QueuePairAttribute::new();
        rtr_attr
            .setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(self.port.mtu)
            .setup_dest_qp_num(remote_rc.qp_num)
            .setup_rq_psn(remote_rc.psn)
            .setup_max_dest_read_atomic(1)
            .setup_min_rnr_timer(12)
            .setup_address_vector(&ah_attr);
        parts
            .qp
            .modify(&rtr_attr)
            .map_err(|error| RpmaError::Backend(error.to_string()))?;

        let mut rts_attr = QueuePairAttribute::new();
        rts_attr
            .setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(parts.local_rc.psn)
            .setup_timeout(14)
            .setup_retry_cnt(7)
            .setup_rnr_retry(7)
            .setup_max_read_atomic(1);
        parts
            .qp
            .modify(&rts_attr)
            .map_err(|error| RpmaError::Backend(error.to_string()))?;
        log::debug!(
            "rc qp connected: local_qpn={}, remote_qpn={}",
            parts.local_rc.qp_num,
            remote_rc.qp_num
        );
        Ok(())
    }

    fn register_scratch(&self, bytes: &[u8]) -> Result<Arc<MemoryRegion>> {
        unsafe {
            self.pd
                .reg_mr(bytes.as_ptr() as usize, bytes.len(), AccessFlags::LocalWrite)
        }
        .map_err(|error| RpmaError::RegistrationDenied(error.to_string()))
    }
}

fn access_for(usage: MrUsage) -> AccessFlags {
    let mut access = AccessFlags::LocalWrite;
    if usage.contains(MrUsage::READ_SRC) {
        access = access | AccessFlags::RemoteRead;
    }
    if usage.contains(MrUsage::WRITE_DST) {
        // Flush reads back from the target, so write destinations must be
        // remotely readable too.
        access = access | AccessFlags::RemoteWrite | AccessFlags::RemoteRead;
    }
    access
}

pub(crate) struct SidewayBackend {
    device: Arc<VerbsDevice>,
    nic_name: String,
}

impl SidewayBackend {
    pub(crate) fn open(config: &SessionConfig, address: &str, role: PeerRole) -> Result<Self> {
        let device_list =
            DeviceList::new().map_err(|error| RpmaError::DeviceNotFound(error.to_string()))?;
        let device = match config.nic_name.as_deref() {
            Some(name) => device_list.iter().find(|device| device.name() == name),
            None => device_list.iter().next(),
        }
        .ok_or_else(|| {
            RpmaError::DeviceNotFound(
                config
                    .nic_name
                    .clone()
                    .unwrap_or_else(|| format!("no RDMA device for {address}")),
            )
        })?;
        let nic_name = device.name().to_string();

        let context = device
            .open()
            .map_err(|error| RpmaError::DeviceNotFound(format!("{nic_name}: {error}")))?;
        let pd = context
            .alloc_pd()
            .map_err(|error| RpmaError::Backend(error.to_string()))?;
        let port = VerbsDevice::choose_port_and_gid(&context)?;
        log::info!(
            "verbs device opened: nic={nic_name}, address={address}, role={role:?}, port={}, gid_index={}",
            port.port_num,
            port.gid_index
        );
        Ok(Self {
            device: Arc::new(VerbsDevice {
                context,
                pd,
                port,
                regions: Mutex::new(HashMap::new()),
            }),
            nic_name,
        })
    }
}

impl RdmaBackend for SidewayBackend {
    fn name(&self) -> &'static str {
        "verbs"
    }

    fn register_memory(&self, addr: u64, len: usize, usage: MrUsage) -> Result<MrKeys> {
        if addr == 0 || len == 0 {
            return Err(RpmaError::InvalidArgument("region must be non-empty"));
        }
        let mr = unsafe { self.device.pd.reg_mr(addr as usize, len, access_for(usage)) }
            .map_err(|error| {
                RpmaError::RegistrationDenied(format!("{}: {error}", self.nic_name))
            })?;
        let keys = MrKeys {
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        };
        self.device.regions.lock().insert(keys.lkey, mr);
        Ok(keys)
    }

    fn deregister_memory(&self, keys: MrKeys) -> Result<()> {
        self.device
            .regions
            .lock()
            .remove(&keys.lkey)
            .map(|_| ())
            .ok_or_else(|| RpmaError::Backend(format!("unknown lkey {:#x}", keys.lkey)))
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

        let mut parts = self.device.create_qp(config.sq_depth)?;
        write_frame(
            &mut stream,
            &ControlMessage::ConnectReq {
                private_data: Bytes::copy_from_slice(private_data),
                rc: Some(parts.local_rc),
            },
        )?;
        let (peer_private_data, remote_rc) = match read_frame(&mut stream) {
            Ok(Some(ControlMessage::ConnectResp {
                private_data,
                rc: Some(rc),
            })) => (private_data, rc),
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
        self.device.connect_qp(&mut parts, remote_rc)?;
        stream.set_read_timeout(None)?;

        log::info!(
            "verbs connection established: peer={remote}, nic={}",
            self.nic_name
        );
        let channel =
            SidewayChannel::start(&self.device, parts, stream, remote, peer_private_data)?;
        Ok(Box::new(channel))
    }

    fn listen(&self, local: SocketAddr) -> Result<Box<dyn PassiveListener>> {
        let listener = TcpListener::bind(local)?;
        let local_addr = listener.local_addr()?;
        log::info!(
            "verbs endpoint listening: addr={local_addr}, nic={}",
            self.nic_name
        );
        Ok(Box::new(SidewayListener {
            listener,
            local_addr,
            device: Arc::clone(&self.device),
        }))
    }
}

struct SidewayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    device: Arc<VerbsDevice>,
}

impl PassiveListener for SidewayListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn next_request(&self) -> Result<Box<dyn PendingConnection>> {
        loop {
            let (mut stream, peer_addr) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
            match read_frame(&mut stream) {
                Ok(Some(ControlMessage::ConnectReq {
                    private_data,
                    rc: Some(remote_rc),
                })) => {
                    return Ok(Box::new(SidewayPendingConnection {
                        stream: Some(stream),
                        peer_addr,
                        peer_private_data: private_data,
                        remote_rc,
                        device: Arc::clone(&self.device),
                    }));
                }
                Ok(other) => {
                    log::warn!(
                        "dropping side channel without an rc connect request: peer={peer_addr}, first={:?}",
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

struct SidewayPendingConnection {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
    peer_private_data: Bytes,
    remote_rc: RcEndpoint,
    device: Arc<VerbsDevice>,
}

impl PendingConnection for SidewayPendingConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn peer_private_data(&self) -> &[u8] {
        &self.peer_private_data
    }

    fn accept(
        mut self: Box<Self>,
        private_data: &[u8],
        config: &ConnectionConfig,
    ) -> Result<Box<dyn QueuePairChannel>> {
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(RpmaError::InvalidArgument("private data exceeds 56 bytes"));
        }
        let mut stream = self.stream.take().ok_or(RpmaError::NotEstablished)?;
        let mut parts = self.device.create_qp(config.sq_depth)?;
        self.device.connect_qp(&mut parts, self.remote_rc)?;
        write_frame(
            &mut stream,
            &ControlMessage::ConnectResp {
                private_data: Bytes::copy_from_slice(private_data),
                rc: Some(parts.local_rc),
            },
        )?;
        stream.set_read_timeout(None)?;
        log::info!("verbs connection accepted: peer={}", self.peer_addr);
        let peer_private_data = std::mem::take(&mut self.peer_private_data);
        let channel =
            SidewayChannel::start(&self.device, parts, stream, self.peer_addr, peer_private_data)?;
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

impl Drop for SidewayPendingConnection {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = write_frame(&mut stream, &ControlMessage::ConnectReject);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[derive(Default)]
struct LinkState {
    local_disconnect: bool,
    peer_gone: bool,
    errored_at: Option<Instant>,
    closed: bool,
}

struct ChannelShared {
    qp: Mutex<GenericQueuePair>,
    send_cq: GenericCompletionQueue,
    _recv_cq: GenericCompletionQueue,
    cq: CompletionQueue,
    /// wr_id -> (kind, signaled) for every work request not yet retired.
    posted: Mutex<BTreeMap<u64, (OpKind, bool)>>,
    link: Mutex<LinkState>,
    closed_cv: Condvar,
    stream: TcpStream,
    peer_addr: SocketAddr,
    flush_mr: Arc<MemoryRegion>,
    flush_scratch: Box<[u8]>,
}

impl ChannelShared {
    fn send_disconnect(&self) {
        let mut writer = &self.stream;
        if let Err(error) = write_frame(&mut writer, &ControlMessage::Disconnect) {
            log::debug!(
                "disconnect notice not delivered: peer={}, error={error}",
                self.peer_addr
            );
        }
    }

    fn on_peer_gone(&self) {
        let mut link = self.link.lock();
        if link.peer_gone {
            return;
        }
        link.peer_gone = true;
        if !std::mem::replace(&mut link.local_disconnect, true) {
            self.send_disconnect();
        }
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Error);
        if let Err(error) = self.qp.lock().modify(&attr) {
            log::warn!(
                "failed to move qp to error state: peer={}, error={error}",
                self.peer_addr
            );
        }
        link.errored_at = Some(Instant::now());
        log::debug!("peer disconnected: peer={}", self.peer_addr);
    }

    fn poll_hardware(&self) -> bool {
        match self.send_cq.start_poll() {
            Ok(mut poller) => {
                let mut progressed = false;
                for wc in &mut poller {
                    progressed = true;
                    let status = WcStatus::from_u32(wc.status());
                    if status != WcStatus::Success {
                        log::debug!(
                            "work completion error: wr_id={}, status={status}, vendor_err={}",
                            wc.wr_id(),
                            wc.vendor_err()
                        );
                    }
                    self.complete(wc.wr_id(), status);
                }
                progressed
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => false,
            Err(error) => {
                log::error!("poll send cq failed: peer={}, error={error}", self.peer_addr);
                false
            }
        }
    }

    fn complete(&self, wr_id: u64, status: WcStatus) {
        let retired = {
            let mut posted = self.posted.lock();
            let newer = posted.split_off(&(wr_id + 1));
            std::mem::replace(&mut *posted, newer)
        };
        let Some(&(op, signaled)) = retired.get(&wr_id) else {
            log::warn!("completion for unknown wr_id={wr_id}, peer={}", self.peer_addr);
            return;
        };
        if signaled || status != WcStatus::Success {
            self.cq.push(WorkCompletion { wr_id, op, status });
        }
    }

    /// Closes the channel once the peer is gone and the errored queue pair
    /// has flushed everything, or has been quiet for `CLOSE_GRACE`.
    fn try_finish_close(&self) -> bool {
        let mut link = self.link.lock();
        if link.closed {
            return true;
        }
        let Some(errored_at) = link.errored_at else {
            return false;
        };
        let mut posted = self.posted.lock();
        if !posted.is_empty() && errored_at.elapsed() < CLOSE_GRACE {
            return false;
        }
        for (wr_id, (op, _)) in std::mem::take(&mut *posted) {
            self.cq.push(WorkCompletion {
                wr_id,
                op,
                status: WcStatus::WrFlushed,
            });
        }
        drop(posted);
        self.cq.close();
        let _ = self.stream.shutdown(Shutdown::Both);
        link.closed = true;
        self.closed_cv.notify_all();
        log::info!("verbs connection closed: peer={}", self.peer_addr);
        true
    }
}

struct SidewayChannel {
    shared: Arc<ChannelShared>,
    peer_private_data: Bytes,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SidewayChannel {
    fn start(
        device: &VerbsDevice,
        parts: QpParts,
        stream: TcpStream,
        peer_addr: SocketAddr,
        peer_private_data: Bytes,
    ) -> Result<Self> {
        let flush_scratch = vec![0_u8; FLUSH_READ_BYTES as usize].into_boxed_slice();
        let flush_mr = device.register_scratch(&flush_scratch)?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(ChannelShared {
            qp: Mutex::new(parts.qp),
            send_cq: parts.send_cq,
            _recv_cq: parts.recv_cq,
            cq: CompletionQueue::new(),
            posted: Mutex::new(BTreeMap::new()),
            link: Mutex::new(LinkState::default()),
            closed_cv: Condvar::new(),
            stream,
            peer_addr,
            flush_mr,
            flush_scratch,
        });

        let progress_shared = Arc::clone(&shared);
        let progress = thread::Builder::new()
            .name("pegaflow-rpma-cq".to_string())
            .spawn(move || Self::progress_loop(progress_shared))?;
        let side_shared = Arc::clone(&shared);
        let side = thread::Builder::new()
            .name("pegaflow-rpma-side".to_string())
            .spawn(move || Self::side_loop(reader, side_shared))?;

        Ok(Self {
            shared,
            peer_private_data,
            threads: Mutex::new(vec![progress, side]),
        })
    }

    fn progress_loop(shared: Arc<ChannelShared>) {
        loop {
            let progressed = shared.poll_hardware();
            if shared.try_finish_close() {
                break;
            }
            if !progressed {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn side_loop(mut stream: TcpStream, shared: Arc<ChannelShared>) {
        loop {
            match read_frame(&mut stream) {
                Ok(Some(ControlMessage::Disconnect)) | Ok(None) => break,
                Ok(Some(other)) => {
                    log::warn!(
                        "unexpected side channel message: peer={}, kind={}",
                        shared.peer_addr,
                        other.kind()
                    );
                }
                Err(error) => {
                    log::debug!(
                        "side channel read failed: peer={}, error={error}",
                        shared.peer_addr
                    );
                    break;
                }
            }
        }
        shared.on_peer_gone();
    }
}

impl QueuePairChannel for SidewayChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    fn peer_private_data(&self) -> &[u8] {
        &self.peer_private_data
    }

    fn post(&self, wr: WorkRequest) -> Result<()> {
        let shared = &self.shared;
        let link = shared.link.lock();
        if link.closed || link.local_disconnect || link.peer_gone {
            return Err(RpmaError::ConnectionLost);
        }
        let flags = if wr.signaled {
            WorkRequestFlags::Signaled
        } else {
            WorkRequestFlags::empty()
        };
        shared
            .posted
            .lock()
            .insert(wr.wr_id, (wr.op.kind(), wr.signaled));

        let mut qp = shared.qp.lock();
        let mut guard = qp.start_post_send();
        let handle = guard.construct_wr(wr.wr_id, flags);
        match wr.op {
            WorkOp::Read { local, remote, len } => unsafe {
                handle
                    .setup_read(remote.rkey, remote.addr)
                    .setup_sge(local.lkey, local.addr, len);
            },
            WorkOp::Write { local, remote, len } => unsafe {
                handle
                    .setup_write(remote.rkey, remote.addr)
                    .setup_sge(local.lkey, local.addr, len);
            },
            WorkOp::Flush { remote, len, .. } => unsafe {
                handle.setup_read(remote.rkey, remote.addr).setup_sge(
                    shared.flush_mr.lkey(),
                    shared.flush_scratch.as_ptr() as u64,
                    len.min(FLUSH_READ_BYTES) as u32,
                );
            },
        }
        guard.post().map_err(|error| {
            shared.posted.lock().remove(&wr.wr_id);
            RpmaError::Backend(format!("post send failed: {error}"))
        })?;
        drop(link);
        Ok(())
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
            if link.closed || std::mem::replace(&mut link.local_disconnect, true) {
                return Ok(());
            }
        }
        log::debug!("disconnecting: peer={}", self.shared.peer_addr);
        self.shared.send_disconnect();
        Ok(())
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

impl Drop for SidewayChannel {
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
