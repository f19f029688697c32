//! Control task object.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sync::{HasMpscNode, MpscNode, Semaphore, Seqlock};

// task is in the ready queue or being fetched from it
pub(super) const STATE_READY: u8 = 0;
// task is in the sleeping queue, waiting for its deadline
pub(super) const STATE_SLEEPING: u8 = 1;
// task cancellation is initiated
pub(super) const STATE_CANCELLING: u8 = 2;
// task is executing or will be executed soon
pub(super) const STATE_PROCESSING: u8 = 3;
// task completion is initiated
pub(super) const STATE_COMPLETING: u8 = 4;
// task is completed and not used anywhere; also the initial state
pub(super) const STATE_COMPLETED: u8 = 5;

pub(super) const FLAG_SUCCEEDED: u32 = 1 << 0;
pub(super) const FLAG_CANCELLED: u32 = 1 << 1;

/// Outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTaskResult {
    Success,
    Failure,
}

pub(super) type Work = Box<dyn FnMut(&ControlTask) -> ControlTaskResult + Send>;

/// Callback invoked on the queue thread after a task completes or cancels.
pub type ControlTaskCompleter = Arc<dyn Fn(&ControlTask) + Send + Sync>;

/// Unit of deferred work executed on the control queue thread.
///
/// A task may be scheduled for immediate or delayed execution, re-scheduled
/// with a new deadline, and cancelled, all lock-free from any thread. After
/// completion the task may be re-scheduled again.
pub struct ControlTask {
    node: MpscNode,
    pub(super) state: AtomicU8,
    pub(super) flags: AtomicU32,

    /// Cuts off concurrent renewals; only one wins.
    pub(super) renew_guard: AtomicBool,
    /// Cuts off concurrent waits; only one is allowed.
    pub(super) wait_guard: AtomicBool,

    /// Deadline requested by the latest renewal, not yet applied:
    /// positive = absolute time, 0 = as soon as possible, -1 = cancel.
    pub(super) renewed_deadline: Seqlock<i64>,
    /// Currently effective deadline; -1 once executed or cancelled.
    pub(super) deadline: AtomicI64,

    pub(super) work: Mutex<Work>,
    pub(super) completer: Mutex<Option<ControlTaskCompleter>>,

    /// Semaphore slot consumed by the completing side (take-or-skip).
    pub(super) sem: Mutex<Option<Arc<Semaphore>>>,
    /// Lazily created semaphore storage, reused across waits.
    pub(super) sem_storage: Mutex<Option<Arc<Semaphore>>>,
}

impl ControlTask {
    /// Creates a task executing the given function on each run.
    pub fn new(
        work: impl FnMut(&ControlTask) -> ControlTaskResult + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: MpscNode::new(),
            state: AtomicU8::new(STATE_COMPLETED),
            flags: AtomicU32::new(0),
            renew_guard: AtomicBool::new(false),
            wait_guard: AtomicBool::new(false),
            renewed_deadline: Seqlock::new(0i64),
            deadline: AtomicI64::new(-1),
            work: Mutex::new(Box::new(work)),
            completer: Mutex::new(None),
            sem: Mutex::new(None),
            sem_storage: Mutex::new(None),
        })
    }

    /// True if the task succeeded, failed, or was cancelled.
    pub fn completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETED
    }

    /// True if the last execution succeeded.
    pub fn succeeded(&self) -> bool {
        self.completed() && self.flags.load(Ordering::Acquire) & FLAG_SUCCEEDED != 0
    }

    /// True if the task was cancelled instead of executed.
    pub fn cancelled(&self) -> bool {
        self.completed() && self.flags.load(Ordering::Acquire) & FLAG_CANCELLED != 0
    }
}

impl HasMpscNode for ControlTask {
    fn mpsc_node(&self) -> &MpscNode {
        &self.node
    }
}
