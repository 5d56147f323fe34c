//! The per-device actor: one worker thread, one priority queue, one
//! in-flight operation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, trace, warn};

use crate::session::DeviceSession;
use crate::MtpError;

/// Submission priorities, totally ordered. Session-lifecycle work runs at
/// `Critical`; it precedes every queued lower-priority item but never
/// preempts the op already on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// A caller's cancellation handle, shared with the running op.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// What a running operation consults between chunks: its cancel token and
/// its deadline.
#[derive(Clone, Debug)]
pub struct OpContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn unbounded() -> Self {
        OpContext {
            cancel: CancelToken::new(),
            deadline: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The cooperative check run at every chunk boundary.
    pub fn check(&self) -> Result<(), MtpError> {
        if self.is_cancelled() {
            return Err(MtpError::Cancelled);
        }
        if self.is_expired() {
            return Err(MtpError::DeadlineExpired);
        }
        Ok(())
    }
}

/// How the worker disposed of one item; drives the needs-resync marking.
enum RunDisposition {
    Completed,
    /// Deadline expiry or cancellation interrupted device traffic.
    Interrupted,
    /// The item resolved without touching the wire (cancelled while
    /// queued).
    SkippedCancelled,
    /// The gateway is closing; stop the worker.
    Shutdown,
}

type RunFn = Box<dyn FnOnce(&mut DeviceSession, &OpContext) -> RunDisposition + Send>;

struct WorkItem {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    timeout: Option<Duration>,
    cancel: CancelToken,
    run: RunFn,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    /// Max-heap order: highest priority first, then FIFO by sequence
    /// within a band.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The result side of a submission.
pub struct OpHandle<T> {
    rx: Receiver<Result<T, MtpError>>,
    cancel: CancelToken,
}

impl<T> OpHandle<T> {
    /// Requests cancellation: a queued op resolves `Cancelled` without
    /// running; an in-flight op observes the token at its next chunk
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Blocks until the operation resolves.
    pub fn wait(self) -> Result<T, MtpError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(MtpError::Internal("gateway worker is gone".into())),
        }
    }

    /// Blocks at most `timeout` for the result.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, MtpError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(MtpError::DeadlineExpired),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(MtpError::Internal("gateway worker is gone".into()))
            }
        }
    }
}

/// The submission side of the actor. Cloneable; all clones feed the same
/// serial queue.
#[derive(Clone)]
pub struct Gateway {
    tx: Sender<WorkItem>,
    seq: Arc<AtomicU64>,
}

impl Gateway {
    /// Submits an operation. `timeout` bounds the whole operation from
    /// submission; `None` falls back to the policy's overall deadline.
    pub fn submit<T, F>(
        &self,
        priority: Priority,
        timeout: Option<Duration>,
        op: F,
    ) -> OpHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DeviceSession, &OpContext) -> Result<T, MtpError> + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let cancel = CancelToken::new();
        let item_cancel = cancel.clone();
        let run: RunFn = Box::new(move |session, ctx| {
            if ctx.is_cancelled() {
                let _ = result_tx.send(Err(MtpError::Cancelled));
                return RunDisposition::SkippedCancelled;
            }
            if ctx.is_expired() {
                let _ = result_tx.send(Err(MtpError::DeadlineExpired));
                return RunDisposition::SkippedCancelled;
            }
            let result = op(session, ctx);
            let disposition = match &result {
                Err(MtpError::Cancelled) | Err(MtpError::DeadlineExpired) => {
                    RunDisposition::Interrupted
                }
                _ => RunDisposition::Completed,
            };
            let _ = result_tx.send(result);
            disposition
        });
        let item = WorkItem {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            enqueued_at: Instant::now(),
            timeout,
            cancel: item_cancel,
            run,
        };
        if self.tx.send(item).is_err() {
            warn!("submitting to a stopped gateway");
        }
        OpHandle {
            rx: result_rx,
            cancel,
        }
    }

    /// Asks the worker to stop after the in-flight operation. Queued items
    /// that never run resolve with a worker-gone error.
    pub(crate) fn request_shutdown(&self) {
        let item = WorkItem {
            priority: Priority::Critical,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            enqueued_at: Instant::now(),
            timeout: None,
            cancel: CancelToken::new(),
            run: Box::new(|_, _| RunDisposition::Shutdown),
        };
        let _ = self.tx.send(item);
    }
}

/// Spawns the actor around an already-connected session. Returns the
/// submission handle and the worker's join handle; the worker exits on
/// [`Gateway::request_shutdown`] or when every [`Gateway`] clone is
/// dropped.
pub(crate) fn spawn(
    mut session: DeviceSession,
) -> (Gateway, Option<std::thread::JoinHandle<()>>) {
    let (tx, rx) = unbounded::<WorkItem>();
    let gateway = Gateway {
        tx,
        seq: Arc::new(AtomicU64::new(0)),
    };
    let spawned = std::thread::Builder::new()
        .name(format!("mtp-gateway-{}", session.device_id))
        .spawn(move || worker_loop(&mut session, rx));
    let worker = match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("could not spawn gateway worker: {e}");
            None
        }
    };
    (gateway, worker)
}

fn worker_loop(session: &mut DeviceSession, rx: Receiver<WorkItem>) {
    let mut heap: BinaryHeap<WorkItem> = BinaryHeap::new();
    debug!("gateway worker for {} started", session.device_id);
    loop {
        // Drain everything already submitted, then block for more only
        // when idle.
        while let Ok(item) = rx.try_recv() {
            heap.push(item);
        }
        let item = match heap.pop() {
            Some(item) => item,
            None => match rx.recv_timeout(session.policy.inactivity_timeout()) {
                Ok(item) => {
                    heap.push(item);
                    continue;
                }
                // An idle device does not keep a session pinned open; the
                // next operation re-opens it.
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    session.close_idle_session();
                    continue;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            },
        };

        let timeout = item
            .timeout
            .unwrap_or_else(|| session.policy.overall_deadline());
        let ctx = OpContext {
            cancel: item.cancel.clone(),
            deadline: Some(item.enqueued_at + timeout),
        };
        trace!(
            "running item seq {} priority {:?} (queued {:?} ago)",
            item.seq,
            item.priority,
            item.enqueued_at.elapsed()
        );
        match (item.run)(session, &ctx) {
            RunDisposition::Completed | RunDisposition::SkippedCancelled => {}
            RunDisposition::Interrupted => {
                // The op aborted mid-transaction; the session must resync
                // before the next wire operation.
                session.mark_needs_resync("operation interrupted by deadline or cancel");
            }
            RunDisposition::Shutdown => break,
        }
    }
    debug!("gateway worker for {} stopping", session.device_id);
    session.shutdown();
}
