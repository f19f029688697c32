//! Pipeline task object.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::sync::{HasMpscNode, MpscNode, Semaphore};

pub(super) const STATE_NEW: u8 = 0;
pub(super) const STATE_SCHEDULED: u8 = 1;
pub(super) const STATE_FINISHED: u8 = 2;

/// Completion callback invoked on the thread that finished the task.
pub(super) type Completer = Box<dyn FnOnce(&PipelineTask) + Send>;

/// Unit of control-plane work executed serially with frame processing.
///
/// A task belongs to at most one pipeline at a time and must be kept alive
/// until it finishes and its completer (if any) has returned. A task can be
/// scheduled only once; the `Finished` state is absorbing.
pub struct PipelineTask {
    node: MpscNode,
    state: AtomicU8,
    success: AtomicBool,
    completer: Mutex<Option<Completer>>,
    sem: Mutex<Option<Arc<Semaphore>>>,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PipelineTask {
    /// Creates a task with no payload.
    pub fn new() -> Arc<Self> {
        Self::with_payload_opt(None)
    }

    /// Creates a task carrying a backend-specific request payload.
    pub fn with_payload(payload: Box<dyn Any + Send>) -> Arc<Self> {
        Self::with_payload_opt(Some(payload))
    }

    fn with_payload_opt(payload: Option<Box<dyn Any + Send>>) -> Arc<Self> {
        Arc::new(Self {
            node: MpscNode::new(),
            state: AtomicU8::new(STATE_NEW),
            success: AtomicBool::new(false),
            completer: Mutex::new(None),
            sem: Mutex::new(None),
            payload: Mutex::new(payload),
        })
    }

    /// True once the task has been executed.
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FINISHED
    }

    /// True if the task finished and succeeded.
    pub fn success(&self) -> bool {
        self.is_finished() && self.success.load(Ordering::Acquire)
    }

    /// Backend-specific request/response payload.
    pub fn payload(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.payload.lock()
    }

    pub(super) fn mark_scheduled(&self) {
        let prev = self
            .state
            .compare_exchange(
                STATE_NEW,
                STATE_SCHEDULED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|actual| {
                panic!(
                    "pipeline task: attempt to schedule task more than once (state={actual})"
                )
            });
        debug_assert_eq!(prev, STATE_NEW);
    }

    pub(super) fn set_completer(&self, completer: Option<Completer>) {
        *self.completer.lock() = completer;
    }

    pub(super) fn take_completer(&self) -> Option<Completer> {
        self.completer.lock().take()
    }

    pub(super) fn attach_semaphore(&self) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new());
        *self.sem.lock() = Some(Arc::clone(&sem));
        sem
    }

    pub(super) fn take_semaphore(&self) -> Option<Arc<Semaphore>> {
        self.sem.lock().take()
    }

    pub(super) fn finish(&self, success: bool) {
        self.success.store(success, Ordering::Release);
        self.state.store(STATE_FINISHED, Ordering::Release);
    }
}

impl HasMpscNode for PipelineTask {
    fn mpsc_node(&self) -> &MpscNode {
        &self.node
    }
}
