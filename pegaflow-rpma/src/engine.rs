//! Transfer engine: posts one-sided operations on a connection and
//! reconciles the completions that come back against what was issued.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    backend::{WorkOp, WorkRequest},
    completion::{Completion, CompletionPolicy, CompletionStatus, FlushType, OpKind, WcStatus},
    connection::{Connection, ConnectionState},
    error::{Result, RpmaError},
    mr::{LocalMr, MrInner, MrUsage, RemoteMr},
};

struct InflightOp {
    wr_id: u64,
    op: OpKind,
    op_context: u64,
    /// The caller asked for a success completion.
    reported: bool,
    _region: Option<Arc<MrInner>>,
}

/// Posted operations in submission order. Completions on a reliable
/// connection arrive in the same order, so a completion for `wr_id` retires
/// every older entry as well.
#[derive(Default)]
pub(crate) struct InflightQueue {
    ops: VecDeque<InflightOp>,
}

impl InflightQueue {
    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    fn push(&mut self, op: InflightOp) {
        self.ops.push_back(op);
    }

    fn retire_through(&mut self, wr_id: u64) -> Option<InflightOp> {
        let position = self.ops.iter().position(|op| op.wr_id == wr_id)?;
        self.ops.drain(..=position).last()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let retired = self.ops.len();
        self.ops.clear();
        retired
    }
}

impl Connection {
    /// RDMA-reads `len` bytes from `src` at `src_offset` into `dst` at
    /// `dst_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &mut self,
        dst: &LocalMr,
        dst_offset: usize,
        src: &RemoteMr,
        src_offset: usize,
        len: usize,
        policy: CompletionPolicy,
        op_context: u64,
    ) -> Result<()> {
        let len32 = check_transfer_len(
            len,
            dst.len(),
            dst_offset,
            src.size(),
            src_offset,
            self.channel.max_transfer_len(),
        )?;
        if !dst.usage().contains(MrUsage::READ_DST) {
            return Err(RpmaError::UsageMismatch(
                "read destination is not registered as READ_DST",
            ));
        }
        if !src.usage().contains(MrUsage::READ_SRC) {
            return Err(RpmaError::UsageMismatch(
                "read source is not exported as READ_SRC",
            ));
        }
        let region = dst.shared();
        let op = WorkOp::Read {
            local: region.sge(dst_offset),
            remote: src.sge(src_offset),
            len: len32,
        };
        self.issue(op, policy, op_context, Some(region))
    }

    /// RDMA-writes `len` bytes from `src` at `src_offset` into `dst` at
    /// `dst_offset`. The bytes are not durable until a flush completes.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        dst: &RemoteMr,
        dst_offset: usize,
        src: &LocalMr,
        src_offset: usize,
        len: usize,
        policy: CompletionPolicy,
        op_context: u64,
    ) -> Result<()> {
        let len32 = check_transfer_len(
            len,
            src.len(),
            src_offset,
            dst.size(),
            dst_offset,
            self.channel.max_transfer_len(),
        )?;
        if !src.usage().contains(MrUsage::WRITE_SRC) {
            return Err(RpmaError::UsageMismatch(
                "write source is not registered as WRITE_SRC",
            ));
        }
        if !dst.usage().contains(MrUsage::WRITE_DST) {
            return Err(RpmaError::UsageMismatch(
                "write destination is not exported as WRITE_DST",
            ));
        }
        let region = src.shared();
        let op = WorkOp::Write {
            local: region.sge(src_offset),
            remote: dst.sge(dst_offset),
            len: len32,
        };
        self.issue(op, policy, op_context, Some(region))
    }

    /// Makes previously completed writes to `dst` durable (`Persistent`) or
    /// visible (`Visibility`) on the peer.
    ///
    /// Returns the flush type actually requested. A persistent flush against
    /// a peer that did not advertise direct write to pmem is downgraded to
    /// visibility, or refused when the connection is configured with
    /// `strict_persistence`.
    pub fn flush(
        &mut self,
        dst: &RemoteMr,
        dst_offset: usize,
        len: usize,
        flush_type: FlushType,
        policy: CompletionPolicy,
        op_context: u64,
    ) -> Result<FlushType> {
        check_range(len, dst.size(), dst_offset)?;
        if !dst.usage().contains(MrUsage::WRITE_DST) {
            return Err(RpmaError::UsageMismatch(
                "flush target is not exported as WRITE_DST",
            ));
        }
        let effective = match flush_type {
            FlushType::Persistent if !self.peer_cfg.direct_write_to_pmem() => {
                if self.config.strict_persistence {
                    return Err(RpmaError::PersistenceUnsupported);
                }
                log::warn!(
                    "peer {} does not support direct write to pmem, flushing for visibility only",
                    self.channel.peer_addr()
                );
                FlushType::Visibility
            }
            other => other,
        };
        let op = WorkOp::Flush {
            remote: dst.sge(dst_offset),
            len: len as u64,
            flush_type: effective,
        };
        self.issue(op, policy, op_context, None)?;
        Ok(effective)
    }

    /// Blocks until at least one completion can be polled.
    pub fn wait_for_completion(&mut self) -> Result<()> {
        self.wait_until(None)
    }

    pub fn wait_for_completion_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    /// Takes the oldest completion without blocking.
    pub fn poll_completion(&mut self) -> Result<Completion> {
        self.ensure_not_poisoned()?;
        self.reconcile()?;
        match self.ready.pop_front() {
            Some(completion) => Ok(completion),
            None if self.channel.is_closed() => Err(RpmaError::ConnectionLost),
            None => Err(RpmaError::NoneAvailable),
        }
    }

    /// Waits for the next completion and checks that it belongs to the
    /// operation issued with `op_context` and succeeded. Any mismatch or
    /// failure poisons the connection.
    pub fn expect_completion(&mut self, op_context: u64, op: OpKind) -> Result<Completion> {
        self.wait_for_completion()?;
        let completion = self.poll_completion()?;
        if completion.op_context != op_context || completion.op != op {
            self.poison();
            log::error!(
                "unexpected completion: expected op={op}, op_context={op_context:#x}, got {completion}"
            );
            return Err(RpmaError::UnexpectedCompletion {
                expected: format!("op={op}, op_context={op_context:#x}"),
                got: completion.to_string(),
            });
        }
        if let CompletionStatus::Error(status) = completion.status {
            self.poison();
            log::error!("{op} failed: op_context={op_context:#x}, status={status}");
            return Err(RpmaError::OperationFailed { op, status });
        }
        Ok(completion)
    }

    /// Number of posted operations not yet retired by a completion.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn issue(
        &mut self,
        op: WorkOp,
        policy: CompletionPolicy,
        op_context: u64,
        region: Option<Arc<MrInner>>,
    ) -> Result<()> {
        self.ensure_not_poisoned()?;
        match self.state {
            ConnectionState::Established => {}
            ConnectionState::Idle | ConnectionState::Connecting => {
                return Err(RpmaError::NotEstablished);
            }
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                return Err(RpmaError::ConnectionLost);
            }
        }
        if self.inflight.len() >= self.config.sq_depth {
            return Err(RpmaError::QueueFull {
                depth: self.config.sq_depth,
            });
        }

        // Unsignaled work requests are only retired by a later completion,
        // so every half queue gets one signaled request whose success is
        // swallowed during reconciliation.
        let reported = policy.signaled();
        let signaled = if reported {
            self.unsignaled_run = 0;
            true
        } else {
            self.unsignaled_run += 1;
            if self.unsignaled_run >= (self.config.sq_depth / 2).max(1) {
                self.unsignaled_run = 0;
                true
            } else {
                false
            }
        };

        let wr_id = self.next_wr_id;
        let kind = op.kind();
        self.channel.post(WorkRequest {
            wr_id,
            op,
            signaled,
        })?;
        self.next_wr_id += 1;
        log::trace!(
            "posted {kind}: wr_id={wr_id}, op_context={op_context:#x}, signaled={signaled}"
        );
        self.inflight.push(InflightOp {
            wr_id,
            op: kind,
            op_context,
            reported,
            _region: region,
        });
        Ok(())
    }

    fn wait_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            self.ensure_not_poisoned()?;
            self.reconcile()?;
            if !self.ready.is_empty() {
                return Ok(());
            }
            self.channel.wait(deadline)?;
        }
    }

    /// Moves backend completions into the ready queue, matching each one to
    /// the work request it retires.
    fn reconcile(&mut self) -> Result<()> {
        while let Some(wc) = self.channel.poll() {
            let Some(issued) = self.inflight.retire_through(wc.wr_id) else {
                self.poison();
                log::error!(
                    "completion for unknown work request: wr_id={}, op={}",
                    wc.wr_id,
                    wc.op
                );
                return Err(RpmaError::UnexpectedCompletion {
                    expected: "an in-flight work request".to_string(),
                    got: format!("wr_id={}, op={}", wc.wr_id, wc.op),
                });
            };
            if issued.op != wc.op {
                self.poison();
                return Err(RpmaError::UnexpectedCompletion {
                    expected: format!("op={} for wr_id={}", issued.op, issued.wr_id),
                    got: format!("op={}", wc.op),
                });
            }
            if wc.status == WcStatus::Success && !issued.reported {
                continue;
            }
            if wc.status != WcStatus::Success {
                log::debug!(
                    "{} completed with error: wr_id={}, op_context={:#x}, status={}",
                    issued.op,
                    issued.wr_id,
                    issued.op_context,
                    wc.status
                );
            }
            self.ready.push_back(Completion {
                op: issued.op,
                op_context: issued.op_context,
                status: CompletionStatus::from_wc(wc.status),
            });
        }
        Ok(())
    }

    fn ensure_not_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(RpmaError::Poisoned);
        }
        Ok(())
    }

    fn poison(&mut self) {
        if !self.poisoned {
            log::warn!("connection poisoned: peer={}", self.channel.peer_addr());
        }
        self.poisoned = true;
    }
}

fn check_range(len: usize, capacity: u64, offset: usize) -> Result<u64> {
    let available = capacity.saturating_sub(offset as u64);
    if offset as u64 > capacity || len as u64 > available {
        return Err(RpmaError::InvalidLength { len, available });
    }
    Ok(available)
}

fn check_transfer_len(
    len: usize,
    local_len: usize,
    local_offset: usize,
    remote_len: u64,
    remote_offset: usize,
    max: u32,
) -> Result<u32> {
    let local = check_range(len, local_len as u64, local_offset)?;
    let remote = check_range(len, remote_len, remote_offset)?;
    u32::try_from(len)
        .ok()
        .filter(|len| *len <= max)
        .ok_or(RpmaError::InvalidLength {
            len,
            available: local.min(remote).min(u64::from(max)),
        })
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::Arc,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use super::{InflightOp, InflightQueue, check_transfer_len};
    use crate::{
        backend::{QueuePairChannel, WorkRequest},
        completion::{
            CompletionPolicy, CompletionQueue, CompletionStatus, FlushType, OpKind, WcStatus,
            WorkCompletion,
        },
        config::{ConnectionConfig, PeerRole, SessionConfig},
        connection::Connection,
        error::{Result, RpmaError},
        mr::{AlignedBuffer, LocalMr, MrUsage, RemoteMr},
        peer_cfg::PeerConfig,
        session::Session,
    };

    /// Channel double: records posts and completes them only when told to.
    struct ScriptedChannel {
        posted: Arc<Mutex<Vec<WorkRequest>>>,
        cq: Arc<CompletionQueue>,
    }

    impl QueuePairChannel for ScriptedChannel {
        fn peer_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 7204))
        }

        fn peer_private_data(&self) -> &[u8] {
            &[]
        }

        fn post(&self, wr: WorkRequest) -> Result<()> {
            self.posted.lock().push(wr);
            Ok(())
        }

        fn poll(&self) -> Option<WorkCompletion> {
            self.cq.poll()
        }

        fn wait(&self, deadline: Option<Instant>) -> Result<()> {
            self.cq.wait(deadline)
        }

        fn drain(&self) -> Vec<WorkCompletion> {
            self.cq.drain()
        }

        fn disconnect(&self) -> Result<()> {
            self.cq.close();
            Ok(())
        }

        fn abort(&self) {
            self.cq.close();
        }

        fn wait_closed(&self) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.cq.is_closed()
        }
    }

    struct Fixture {
        session: Session,
        conn: Connection,
        posted: Arc<Mutex<Vec<WorkRequest>>>,
        cq: Arc<CompletionQueue>,
    }

    fn fixture(config: ConnectionConfig) -> Fixture {
        let session =
            Session::open("127.0.0.1", PeerRole::Client, SessionConfig::default()).expect("open");
        let posted = Arc::new(Mutex::new(Vec::new()));
        let cq = Arc::new(CompletionQueue::new());
        let channel = ScriptedChannel {
            posted: Arc::clone(&posted),
            cq: Arc::clone(&cq),
        };
        let conn = Connection::established(Arc::clone(session.inner()), Box::new(channel), config);
        Fixture {
            session,
            conn,
            posted,
            cq,
        }
    }

    fn local(session: &Session, len: usize, usage: MrUsage) -> LocalMr {
        session
            .register(AlignedBuffer::new(len).expect("alloc"), usage)
            .expect("register")
    }

    fn remote(session: &Session, len: usize) -> (LocalMr, RemoteMr) {
        let mr = local(session, len, MrUsage::WRITE_DST | MrUsage::READ_SRC);
        let remote = RemoteMr::from_descriptor(&mr.descriptor()).expect("descriptor");
        (mr, remote)
    }

    fn complete(cq: &CompletionQueue, wr: &WorkRequest, status: WcStatus) {
        cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            op: wr.op.kind(),
            status,
        });
    }

    #[test]
    fn retire_through_drops_older_entries() {
        let mut queue = InflightQueue::default();
        for wr_id in 1..=3 {
            queue.push(InflightOp {
                wr_id,
                op: OpKind::Write,
                op_context: wr_id * 10,
                reported: false,
                _region: None,
            });
        }
        let retired = queue.retire_through(2).expect("known wr_id");
        assert_eq!(retired.op_context, 20);
        assert_eq!(queue.len(), 1);
        assert!(queue.retire_through(1).is_none());
        assert_eq!(queue.clear(), 1);
    }

    #[test]
    fn transfer_len_covers_both_regions() {
        assert_eq!(
            check_transfer_len(100, 100, 0, 200, 100, u32::MAX).expect("fits"),
            100
        );
        assert_eq!(
            check_transfer_len(101, 100, 0, 200, 0, u32::MAX),
            Err(RpmaError::InvalidLength {
                len: 101,
                available: 100
            })
        );
        assert_eq!(
            check_transfer_len(60, 100, 0, 100, 50, u32::MAX),
            Err(RpmaError::InvalidLength {
                len: 60,
                available: 50
            })
        );
        assert!(check_transfer_len(0, 100, 101, 100, 0, u32::MAX).is_err());
    }

    #[test]
    fn transfer_len_respects_transport_limit() {
        assert_eq!(check_transfer_len(64, 100, 0, 100, 0, 64).expect("fits"), 64);
        assert_eq!(
            check_transfer_len(65, 100, 0, 100, 0, 64),
            Err(RpmaError::InvalidLength {
                len: 65,
                available: 64
            })
        );
    }

    #[test]
    fn oversized_write_enqueues_nothing() {
        let mut fx = fixture(ConnectionConfig::default());
        let src = local(&fx.session, 64, MrUsage::WRITE_SRC);
        let (_dst_mr, dst) = remote(&fx.session, 32);
        let err = fx
            .conn
            .write(&dst, 0, &src, 0, 64, CompletionPolicy::Always, 1)
            .expect_err("too long");
        assert_eq!(
            err,
            RpmaError::InvalidLength {
                len: 64,
                available: 32
            }
        );
        assert!(fx.posted.lock().is_empty());
        assert_eq!(fx.conn.inflight(), 0);
    }

    #[test]
    fn usage_is_checked_before_posting() {
        let mut fx = fixture(ConnectionConfig::default());
        let src = local(&fx.session, 64, MrUsage::READ_DST);
        let (_dst_mr, dst) = remote(&fx.session, 64);
        assert!(matches!(
            fx.conn.write(&dst, 0, &src, 0, 8, CompletionPolicy::Always, 1),
            Err(RpmaError::UsageMismatch(_))
        ));
        assert!(fx.posted.lock().is_empty());
    }

    #[test]
    fn completions_come_back_in_order_with_contexts() {
        let mut fx = fixture(ConnectionConfig::default());
        let src = local(&fx.session, 64, MrUsage::WRITE_SRC);
        let (_dst_mr, dst) = remote(&fx.session, 64);
        for ctx in 0..3_u64 {
            fx.conn
                .write(&dst, 0, &src, 0, 8, CompletionPolicy::Always, ctx)
                .expect("write");
        }
        assert_eq!(src.inflight(), 3);
        for wr in fx.posted.lock().iter() {
            complete(&fx.cq, wr, WcStatus::Success);
        }
        for ctx in 0..3_u64 {
            let completion = fx.conn.expect_completion(ctx, OpKind::Write).expect("match");
            assert!(completion.status.is_success());
        }
        assert_eq!(fx.conn.poll_completion(), Err(RpmaError::NoneAvailable));
        assert_eq!(src.inflight(), 0);
    }

    #[test]
    fn unsignaled_success_is_silent_but_error_is_reported() {
        let mut fx = fixture(ConnectionConfig::default());
        let src = local(&fx.session, 64, MrUsage::WRITE_SRC);
        let (_dst_mr, dst) = remote(&fx.session, 64);
        fx.conn
            .write(&dst, 0, &src, 0, 8, CompletionPolicy::OnErrorOnly, 7)
            .expect("write");
        fx.conn
            .write(&dst, 8, &src, 8, 8, CompletionPolicy::OnErrorOnly, 8)
            .expect("write");
        let posted = fx.posted.lock().clone();
        assert!(!posted[0].signaled);
        complete(&fx.cq, &posted[1], WcStatus::RemoteAccess);

        let completion = fx.conn.poll_completion().expect("error completion");
        assert_eq!(completion.op_context, 8);
        assert_eq!(
            completion.status,
            CompletionStatus::Error(WcStatus::RemoteAccess)
        );
        assert_eq!(fx.conn.inflight(), 0);
    }

    #[test]
    fn unsignaled_runs_are_periodically_signaled() {
        let mut fx = fixture(ConnectionConfig::default().with_sq_depth(4));
        let src = local(&fx.session, 64, MrUsage::WRITE_SRC);
        let (_dst_mr, dst) = remote(&fx.session, 64);
        for ctx in 0..2 {
            fx.conn
                .write(&dst, 0, &src, 0, 8, CompletionPolicy::OnErrorOnly, ctx)
                .expect("write");
        }
        let posted = fx.posted.lock().clone();
        assert!(!posted[0].signaled);
        assert!(posted[1].signaled);

        complete(&fx.cq, &posted[1], WcStatus::Success);
        assert_eq!(fx.conn.poll_completion(), Err(RpmaError::NoneAvailable));
        assert_eq!(fx.conn.inflight(), 0);
    }

    #[test]
    fn queue_full_is_reported() {
        let mut fx = fixture(ConnectionConfig::default().with_sq_depth(2));
        let src = local(&fx.session, 64, MrUsage::WRITE_SRC);
        let (_dst_mr, dst) = remote(&fx.session, 64);
        for ctx in 0..2 {
            fx.conn
                .write(&dst, 0, &src, 0, 8, CompletionPolicy::Always, ctx)
                .expect("write");
        }
        assert_eq!(
            fx.conn
                .write(&dst, 0, &src, 0, 8, CompletionPolicy::Always, 2),
            Err(RpmaError::QueueFull { depth: 2 })
        );
    }

    #[test]
    fn persistent_flush_downgrades_without_pmem() {
        let mut fx = fixture(ConnectionConfig::default());
        let (_dst_mr, dst) = remote(&fx.session, 64);
        let used = fx
            .conn
            .flush(&dst, 0, 64, FlushType::Persistent, CompletionPolicy::Always, 1)
            .expect("flush");
        assert_eq!(used, FlushType::Visibility);

        fx.conn
            .apply_remote_peer_cfg(PeerConfig::new().with_direct_write_to_pmem(true));
        let used = fx
            .conn
            .flush(&dst, 0, 64, FlushType::Persistent, CompletionPolicy::Always, 2)
            .expect("flush");
        assert_eq!(used, FlushType::Persistent);
    }

    #[test]
    fn strict_persistence_refuses_downgrade() {
        let mut fx = fixture(ConnectionConfig::default().with_strict_persistence(true));
        let (_dst_mr, dst) = remote(&fx.session, 64);
        assert_eq!(
            fx.conn
                .flush(&dst, 0, 64, FlushType::Persistent, CompletionPolicy::Always, 1),
            Err(RpmaError::PersistenceUnsupported)
        );
        assert!(fx.posted.lock().is_empty());
    }

    #[test]
    fn unknown_completion_poisons_connection() {
        let mut fx = fixture(ConnectionConfig::default());
        fx.cq.push(WorkCompletion {
            wr_id: 99,
            op: OpKind::Write,
            status: WcStatus::Success,
        });
        assert!(matches!(
            fx.conn.poll_completion(),
            Err(RpmaError::UnexpectedCompletion { .. })
        ));
        assert!(fx.conn.is_poisoned());
        assert_eq!(fx.conn.poll_completion(), Err(RpmaError::Poisoned));
    }

    #[test]
    fn mismatched_context_poisons_connection() {
        let mut fx = fixture(ConnectionConfig::default());
        let (_dst_mr, dst) = remote(&fx.session, 64);
        fx.conn
            .flush(&dst, 0, 64, FlushType::Visibility, CompletionPolicy::Always, 1)
            .expect("flush");
        let wr = fx.posted.lock()[0];
        complete(&fx.cq, &wr, WcStatus::Success);
        assert!(matches!(
            fx.conn.expect_completion(0xF01D, OpKind::Flush),
            Err(RpmaError::UnexpectedCompletion { .. })
        ));
        assert!(fx.conn.is_poisoned());
    }

    #[test]
    fn failed_operation_is_reported_by_expect() {
        let mut fx = fixture(ConnectionConfig::default());
        let (_dst_mr, dst) = remote(&fx.session, 64);
        fx.conn
            .flush(&dst, 0, 64, FlushType::Visibility, CompletionPolicy::Always, 5)
            .expect("flush");
        let wr = fx.posted.lock()[0];
        complete(&fx.cq, &wr, WcStatus::RemoteAccess);
        assert_eq!(
            fx.conn.expect_completion(5, OpKind::Flush),
            Err(RpmaError::OperationFailed {
                op: OpKind::Flush,
                status: WcStatus::RemoteAccess
            })
        );
    }

    #[test]
    fn wait_times_out_without_completions() {
        let mut fx = fixture(ConnectionConfig::default());
        assert!(matches!(
            fx.conn
                .wait_for_completion_timeout(Duration::from_millis(20)),
            Err(RpmaError::Timeout(_))
        ));
    }

    #[test]
    fn closed_channel_reports_connection_lost() {
        let mut fx = fixture(ConnectionConfig::default());
        fx.conn.disconnect().expect("disconnect");
        assert_eq!(fx.conn.poll_completion(), Err(RpmaError::ConnectionLost));
        assert_eq!(fx.conn.wait_for_completion(), Err(RpmaError::ConnectionLost));
        fx.conn.wait_closed().expect("closed");
        assert_eq!(fx.session.open_connections(), 1);
        drop(fx.conn);
        assert_eq!(fx.session.open_connections(), 0);
    }
}
