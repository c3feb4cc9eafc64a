use std::{
    collections::VecDeque,
    fmt::{Display, Formatter},
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RpmaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Flush,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Flush => "flush",
        };
        f.write_str(name)
    }
}

/// Whether a successful operation produces a completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    OnErrorOnly,
    Always,
}

impl CompletionPolicy {
    pub(crate) fn signaled(self) -> bool {
        self == CompletionPolicy::Always
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Written bytes reached the persistence domain of the peer.
    Persistent,
    /// Written bytes are visible to subsequent reads on the peer.
    Visibility,
}

/// Work completion status codes, numbered like `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WcStatus {
    Success = 0,
    LocalLength = 1,
    LocalQpOperation = 2,
    LocalProtection = 4,
    WrFlushed = 5,
    RemoteInvalidRequest = 9,
    RemoteAccess = 10,
    RemoteOperation = 11,
    RetryExceeded = 12,
    General = 21,
}

impl WcStatus {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::LocalLength,
            2 => Self::LocalQpOperation,
            4 => Self::LocalProtection,
            5 => Self::WrFlushed,
            9 => Self::RemoteInvalidRequest,
            10 => Self::RemoteAccess,
            11 => Self::RemoteOperation,
            12 => Self::RetryExceeded,
            _ => Self::General,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl Display for WcStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            WcStatus::Success => "success",
            WcStatus::LocalLength => "local length error",
            WcStatus::LocalQpOperation => "local QP operation error",
            WcStatus::LocalProtection => "local protection error",
            WcStatus::WrFlushed => "Work Request Flushed Error",
            WcStatus::RemoteInvalidRequest => "remote invalid request error",
            WcStatus::RemoteAccess => "remote access error",
            WcStatus::RemoteOperation => "remote operation error",
            WcStatus::RetryExceeded => "transport retry counter exceeded",
            WcStatus::General => "general error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error(WcStatus),
}

impl CompletionStatus {
    pub(crate) fn from_wc(status: WcStatus) -> Self {
        if status == WcStatus::Success {
            CompletionStatus::Success
        } else {
            CompletionStatus::Error(status)
        }
    }

    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

/// A reconciled completion handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub op: OpKind,
    pub op_context: u64,
    pub status: CompletionStatus,
}

impl Display for Completion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completion(op={}, op_context={:#x}, status={:?})",
            self.op, self.op_context, self.status
        )
    }
}

/// Backend-level completion keyed by the work request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkCompletion {
    pub(crate) wr_id: u64,
    pub(crate) op: OpKind,
    pub(crate) status: WcStatus,
}

#[derive(Default)]
struct CqState {
    entries: VecDeque<WorkCompletion>,
    closed: bool,
}

/// Completion queue shared between a backend's progress thread and the
/// connection owner.
#[derive(Default)]
pub(crate) struct CompletionQueue {
    state: Mutex<CqState>,
    ready_cv: Condvar,
}

impl CompletionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.entries.push_back(wc);
        self.ready_cv.notify_all();
    }

    /// Stops accepting completions. Queued entries stay pollable.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready_cv.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn poll(&self) -> Option<WorkCompletion> {
        self.state.lock().entries.pop_front()
    }

    pub(crate) fn drain(&self) -> Vec<WorkCompletion> {
        self.state.lock().entries.drain(..).collect()
    }

    /// Blocks until an entry is queued. Closed and empty is `ConnectionLost`.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if !state.entries.is_empty() {
                return Ok(());
            }
            if state.closed {
                return Err(RpmaError::ConnectionLost);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RpmaError::Timeout("waiting for completion"));
                    }
                    self.ready_cv.wait_for(&mut state, deadline - now);
                }
                None => self.ready_cv.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use super::{CompletionQueue, OpKind, WcStatus, WorkCompletion};
    use crate::error::RpmaError;

    fn wc(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            op: OpKind::Write,
            status: WcStatus::Success,
        }
    }

    #[test]
    fn wait_does_not_consume() {
        let cq = CompletionQueue::new();
        cq.push(wc(7));
        cq.wait(None).expect("entry queued");
        assert_eq!(cq.poll(), Some(wc(7)));
        assert_eq!(cq.poll(), None);
    }

    #[test]
    fn wait_wakes_on_push_from_other_thread() {
        let cq = Arc::new(CompletionQueue::new());
        let producer = Arc::clone(&cq);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(wc(1));
        });
        cq.wait(None).expect("woken by push");
        handle.join().expect("producer");
        assert_eq!(cq.poll().map(|wc| wc.wr_id), Some(1));
    }

    #[test]
    fn closed_queue_reports_connection_lost_once_empty() {
        let cq = CompletionQueue::new();
        cq.push(wc(3));
        cq.close();
        cq.push(wc(4));
        cq.wait(None).expect("queued entry survives close");
        assert_eq!(cq.poll().map(|wc| wc.wr_id), Some(3));
        assert_eq!(cq.wait(None), Err(RpmaError::ConnectionLost));
    }

    #[test]
    fn wait_honors_deadline() {
        let cq = CompletionQueue::new();
        let err = cq
            .wait(Some(Instant::now() + Duration::from_millis(10)))
            .expect_err("nothing queued");
        assert_eq!(err, RpmaError::Timeout("waiting for completion"));
    }

    #[test]
    fn status_codes_follow_verbs_numbering() {
        assert_eq!(WcStatus::from_u32(5), WcStatus::WrFlushed);
        assert_eq!(WcStatus::RemoteAccess.code(), 10);
        assert_eq!(WcStatus::from_u32(999), WcStatus::General);
    }
}
