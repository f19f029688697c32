//! Bridges a pipeline loop to the control task queue.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{ControlTask, ControlTaskQueue, ControlTaskResult};
use crate::pipeline::TaskScheduler;

type Target = Arc<dyn Fn() + Send + Sync>;

/// [`TaskScheduler`] implementation backed by a [`ControlTaskQueue`].
///
/// The pipeline asks for a deferred `process_tasks()` call; this adapter
/// turns that into a control task scheduled at the hinted deadline. One
/// adapter serves one pipeline; the target callback is bound after the
/// pipeline is constructed to break the construction cycle.
pub struct ControlPipelineScheduler {
    queue: Arc<ControlTaskQueue>,
    task: Arc<ControlTask>,
    target: Arc<Mutex<Option<Target>>>,
}

impl ControlPipelineScheduler {
    pub fn new(queue: Arc<ControlTaskQueue>) -> Arc<Self> {
        let target: Arc<Mutex<Option<Target>>> = Arc::new(Mutex::new(None));

        let task_target = Arc::clone(&target);
        let task = ControlTask::new(move |_| {
            let callback = task_target.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
            ControlTaskResult::Success
        });

        Arc::new(Self {
            queue,
            task,
            target,
        })
    }

    /// Binds the callback invoked when the scheduled processing fires;
    /// typically `move || pipeline.process_tasks()`.
    pub fn bind(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.target.lock() = Some(Arc::new(callback));
    }
}

impl TaskScheduler for ControlPipelineScheduler {
    fn schedule_task_processing(&self, deadline_ns: i64) {
        if deadline_ns <= 0 {
            self.queue.schedule(&self.task, None);
        } else {
            self.queue.schedule_at(&self.task, deadline_ns, None);
        }
    }

    fn cancel_task_processing(&self) {
        self.queue.async_cancel(&self.task);
    }
}
