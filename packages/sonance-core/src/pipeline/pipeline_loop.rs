//! Pipeline loop: serialized frame and task processing with precise task
//! scheduling.
//!
//! The pipeline has no thread of its own. Frames and tasks are both processed
//! on caller threads, serialized by the pipeline mutex. The frame caller is
//! real-time and must not be delayed, so task work is squeezed into dedicated
//! time slices: short bursts between sub-frames, and inter-frame windows that
//! an external scheduler is asked to drive via `process_tasks()`.
//!
//! `schedule()` and `process_tasks()` never block on a contended mutex: they
//! use `try_lock` and fall back to enqueueing. Counters are atomics, 64-bit
//! time values go through seqlocks, and the task queue is the intrusive MPSC
//! queue, so the fast paths stay lock-free.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::task::{Completer, PipelineTask};
use crate::audio::{Frame, FrameFactory, FrameMode, SampleSpec};
use crate::error::Result;
use crate::packet::StreamTimestamp;
use crate::sync::{MpscQueue, RateLimiter, Seqlock};
use crate::time;

const STATS_REPORT_INTERVAL: i64 = 60 * time::SECOND;

const PROC_NOT_SCHEDULED: u8 = 0;
const PROC_SCHEDULED: u8 = 1;
const PROC_RUNNING: u8 = 2;

/// Pipeline direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames are read from the pipeline (receiver side).
    ReadFrames,
    /// Frames are written into the pipeline (sender side).
    WriteFrames,
}

/// Task processing parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipelineLoopConfig {
    /// Enable precise task scheduling mode.
    ///
    /// When disabled, frame and task processing simply compete for the
    /// pipeline mutex and the remaining settings have no effect.
    pub enable_precise_task_scheduling: bool,

    /// Minimum frame duration between task bursts. In-frame task processing
    /// does not start until at least this many samples were processed.
    pub min_frame_length_between_tasks: i64,

    /// Maximum frame duration between task bursts. Larger frames are split
    /// into sub-frames to allow task processing in between. Zero disables
    /// splitting.
    pub max_frame_length_between_tasks: i64,

    /// Upper bound on wall-clock time a task burst may spend between two
    /// sub-frames. At least one task is processed per burst regardless.
    pub max_inframe_task_processing: i64,

    /// Width of the symmetric window around each predicted frame deadline in
    /// which no task processing is permitted.
    pub task_processing_prohibited_interval: i64,
}

impl Default for PipelineLoopConfig {
    fn default() -> Self {
        Self {
            enable_precise_task_scheduling: true,
            min_frame_length_between_tasks: 200 * time::MICROSECOND,
            max_frame_length_between_tasks: time::MILLISECOND,
            max_inframe_task_processing: 20 * time::MICROSECOND,
            task_processing_prohibited_interval: 200 * time::MICROSECOND,
        }
    }
}

/// Time and thread-identity source, injectable for tests.
pub trait PipelineClock: Send + Sync {
    /// Monotonic nanoseconds.
    fn timestamp_ns(&self) -> i64;
    /// Id of the calling thread; never zero.
    fn tid(&self) -> u64;
}

/// Production clock.
pub struct RealClock;

impl PipelineClock for RealClock {
    fn timestamp_ns(&self) -> i64 {
        time::monotonic_ns()
    }

    fn tid(&self) -> u64 {
        time::thread_id()
    }
}

/// External scheduler driving asynchronous `process_tasks()` invocations.
///
/// The pipeline cannot call itself later, so when pending tasks remain and
/// no frame caller is around to drain them, it asks this scheduler to invoke
/// `process_tasks()` at the hinted deadline (0 = as soon as possible).
pub trait TaskScheduler: Send + Sync {
    fn schedule_task_processing(&self, deadline_ns: i64);
    fn cancel_task_processing(&self);
}

/// Frame and task execution hooks provided by a concrete pipeline.
pub trait PipelineBackend: Send {
    /// Reads or writes one (sub-)frame.
    fn process_subframe(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()>;

    /// Executes one task; the return value becomes the task's success bit.
    fn process_task(&mut self, task: &PipelineTask) -> bool;
}

#[derive(Default)]
struct Stats {
    task_processed_total: AtomicU64,
    task_processed_in_place: AtomicU64,
    task_processed_in_frame: AtomicU64,
    preemptions: AtomicU64,
    scheduler_calls: AtomicU64,
    scheduler_cancellations: AtomicU64,
}

/// Point-in-time view of the loop's task statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub task_processed_total: u64,
    pub task_processed_in_place: u64,
    pub task_processed_in_frame: u64,
    pub preemptions: u64,
    pub scheduler_calls: u64,
    pub scheduler_cancellations: u64,
}

struct PipelineState<B> {
    backend: B,
    scratch_factory: FrameFactory,
    subframe: Option<Frame>,
    /// Wall-clock instant when the current in-frame task burst must end.
    subframe_tasks_deadline: i64,
    /// Samples processed since the last task burst.
    samples_processed: StreamTimestamp,
    enough_samples_to_process_tasks: bool,
}

/// Base of task-based pipelines; see the module docs for the scheduling
/// design.
pub struct PipelineLoop<B: PipelineBackend> {
    config: PipelineLoopConfig,
    direction: Direction,
    sample_spec: SampleSpec,

    min_samples_between_tasks: StreamTimestamp,
    max_samples_between_tasks: StreamTimestamp,
    no_task_proc_half_interval: i64,

    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn PipelineClock>,

    /// Protects the pipeline state; held only while processing a frame or a
    /// task step.
    state: Mutex<PipelineState<B>>,
    /// Serializes calls into the external scheduler.
    scheduler_mutex: Mutex<()>,

    task_queue: MpscQueue<PipelineTask>,
    pending_tasks: AtomicUsize,
    pending_frames: AtomicUsize,
    processing_state: AtomicU8,

    frame_processing_tid: Seqlock<u64>,
    next_frame_deadline: Seqlock<i64>,

    stats: Stats,
    report_limiter: RateLimiter,
}

impl<B: PipelineBackend> PipelineLoop<B> {
    pub fn new(
        backend: B,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn PipelineClock>,
        config: PipelineLoopConfig,
        sample_spec: SampleSpec,
        direction: Direction,
    ) -> Self {
        Self {
            min_samples_between_tasks: sample_spec
                .ns_to_stream_timestamp(config.min_frame_length_between_tasks),
            max_samples_between_tasks: sample_spec
                .ns_to_stream_timestamp(config.max_frame_length_between_tasks),
            no_task_proc_half_interval: config.task_processing_prohibited_interval / 2,
            config,
            direction,
            sample_spec,
            scheduler,
            clock,
            state: Mutex::new(PipelineState {
                backend,
                scratch_factory: FrameFactory::new(1),
                subframe: None,
                subframe_tasks_deadline: 0,
                samples_processed: 0,
                enough_samples_to_process_tasks: false,
            }),
            scheduler_mutex: Mutex::new(()),
            task_queue: MpscQueue::new(),
            pending_tasks: AtomicUsize::new(0),
            pending_frames: AtomicUsize::new(0),
            processing_state: AtomicU8::new(PROC_NOT_SCHEDULED),
            frame_processing_tid: Seqlock::new(0u64),
            next_frame_deadline: Seqlock::new(0i64),
            stats: Stats::default(),
            report_limiter: RateLimiter::new(STATS_REPORT_INTERVAL),
        }
    }

    /// Number of tasks enqueued but not yet finished.
    pub fn num_pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::SeqCst)
    }

    /// Number of frame callers currently blocked on or inside the pipeline.
    pub fn num_pending_frames(&self) -> usize {
        self.pending_frames.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            task_processed_total: self.stats.task_processed_total.load(Ordering::Relaxed),
            task_processed_in_place: self
                .stats
                .task_processed_in_place
                .load(Ordering::Relaxed),
            task_processed_in_frame: self
                .stats
                .task_processed_in_frame
                .load(Ordering::Relaxed),
            preemptions: self.stats.preemptions.load(Ordering::Relaxed),
            scheduler_calls: self.stats.scheduler_calls.load(Ordering::Relaxed),
            scheduler_cancellations: self
                .stats
                .scheduler_cancellations
                .load(Ordering::Relaxed),
        }
    }

    /// Enqueues a task for asynchronous execution.
    ///
    /// May execute the task in place when the current instant falls into a
    /// task-processing time slice. The completer is invoked exactly once, on
    /// the thread that finishes the task; after it returns, the loop no
    /// longer touches the task.
    pub fn schedule(
        &self,
        task: Arc<PipelineTask>,
        completer: impl FnOnce(&PipelineTask) + Send + 'static,
    ) {
        task.mark_scheduled();
        task.set_completer(Some(Box::new(completer) as Completer));

        self.schedule_and_maybe_process(task);
    }

    /// Enqueues a task and blocks until it finishes.
    ///
    /// Returns the task's success bit.
    pub fn schedule_and_wait(&self, task: Arc<PipelineTask>) -> bool {
        task.mark_scheduled();
        task.set_completer(None);
        let sem = task.attach_semaphore();

        let processed = self.schedule_and_maybe_process(Arc::clone(&task));

        if !processed {
            sem.wait();
        }

        task.success()
    }

    /// Processes queued tasks until the queue empties, a frame arrives, or
    /// the prohibited window around the next frame deadline begins.
    ///
    /// Intended to be invoked by the external scheduler.
    pub fn process_tasks(&self) {
        let need_reschedule = self.maybe_process_tasks();

        self.processing_state
            .store(PROC_NOT_SCHEDULED, Ordering::SeqCst);

        if need_reschedule {
            self.schedule_async_task_processing();
        }
    }

    /// Delivers or obtains one frame, splitting it into sub-frames and
    /// draining tasks between them within the configured budgets.
    pub fn process_subframes_and_tasks(
        &self,
        frame: &mut Frame,
        frame_duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        if self.config.enable_precise_task_scheduling {
            self.process_subframes_and_tasks_precise(frame, frame_duration, mode)
        } else {
            self.process_subframes_and_tasks_simple(frame, frame_duration, mode)
        }
    }

    fn process_subframes_and_tasks_simple(
        &self,
        frame: &mut Frame,
        frame_duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        self.pending_frames.fetch_add(1, Ordering::SeqCst);

        self.cancel_async_task_processing();

        let mut state = self.state.lock();
        let frame_status = state.backend.process_subframe(frame, frame_duration, mode);
        drop(state);

        if self.pending_frames.fetch_sub(1, Ordering::SeqCst) == 1
            && self.pending_tasks.load(Ordering::SeqCst) != 0
        {
            self.schedule_async_task_processing();
        }

        frame_status
    }

    fn process_subframes_and_tasks_precise(
        &self,
        frame: &mut Frame,
        frame_duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        self.pending_frames.fetch_add(1, Ordering::SeqCst);

        let frame_start_time = self.clock.timestamp_ns();

        self.cancel_async_task_processing();

        // frames have priority: this acquire is allowed to block
        let mut state = self.state.lock();

        let mut next_frame_deadline = 0i64;
        let mut frame_pos: StreamTimestamp = 0;
        let mut frame_status = Ok(());

        loop {
            let first_iteration = frame_pos == 0;

            frame_status = self.process_next_subframe(
                &mut state,
                frame,
                &mut frame_pos,
                frame_duration,
                mode,
            );

            if first_iteration {
                next_frame_deadline = frame_start_time
                    + self.sample_spec.stream_timestamp_to_ns(frame_duration);
                self.next_frame_deadline.exclusive_store(next_frame_deadline);
            }

            if Self::start_subframe_task_processing(
                &mut state,
                self.pending_tasks.load(Ordering::SeqCst),
            ) {
                while let Some(task) = self.task_queue.try_pop() {
                    self.process_task(&mut state, &task, true);
                    self.pending_tasks.fetch_sub(1, Ordering::SeqCst);

                    self.stats
                        .task_processed_total
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .task_processed_in_frame
                        .fetch_add(1, Ordering::Relaxed);

                    if !self.subframe_task_processing_allowed(&state, next_frame_deadline) {
                        break;
                    }
                }
            }

            if frame_status.is_err() || frame_pos == frame_duration {
                break;
            }
        }

        self.report_stats();

        self.frame_processing_tid.exclusive_store(self.clock.tid());

        drop(state);

        if self.pending_frames.fetch_sub(1, Ordering::SeqCst) == 1
            && self.pending_tasks.load(Ordering::SeqCst) != 0
        {
            self.schedule_async_task_processing();
        }

        frame_status
    }

    fn schedule_and_maybe_process(&self, task: Arc<PipelineTask>) -> bool {
        if self.pending_tasks.fetch_add(1, Ordering::SeqCst) != 0 {
            self.task_queue.push(task);
            return false;
        }

        let next_frame_deadline = match self.next_frame_deadline.try_load() {
            Some(deadline) => deadline,
            None => {
                self.task_queue.push(task);
                return false;
            }
        };

        if !self.interframe_task_processing_allowed(next_frame_deadline) {
            self.task_queue.push(task);

            if self.pending_frames.load(Ordering::SeqCst) == 0 {
                self.schedule_async_task_processing();
            }

            return false;
        }

        let mut state = match self.state.try_lock() {
            Some(state) => state,
            None => {
                self.task_queue.push(task);
                return false;
            }
        };

        self.process_task(&mut state, &task, false);
        self.pending_tasks.fetch_sub(1, Ordering::SeqCst);

        self.stats
            .task_processed_total
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .task_processed_in_place
            .fetch_add(1, Ordering::Relaxed);

        let n_pending_frames = self.pending_frames.load(Ordering::SeqCst);
        if n_pending_frames != 0 {
            self.stats.preemptions.fetch_add(1, Ordering::Relaxed);
        }

        drop(state);

        if n_pending_frames == 0 && self.pending_tasks.load(Ordering::SeqCst) != 0 {
            self.schedule_async_task_processing();
        }

        true
    }

    fn maybe_process_tasks(&self) -> bool {
        let next_frame_deadline = match self.next_frame_deadline.try_load() {
            Some(deadline) => deadline,
            None => return false,
        };

        let mut state = match self.state.try_lock() {
            Some(state) => state,
            // a frame is in progress; the frame path will drain the queue
            None => return false,
        };

        self.processing_state.store(PROC_RUNNING, Ordering::SeqCst);

        let mut n_pending_frames = 0;

        loop {
            if !self.interframe_task_processing_allowed(next_frame_deadline) {
                break;
            }

            n_pending_frames = self.pending_frames.load(Ordering::SeqCst);
            if n_pending_frames != 0 {
                break;
            }

            let task = match self.task_queue.try_pop() {
                Some(task) => task,
                None => break,
            };

            self.process_task(&mut state, &task, true);
            self.pending_tasks.fetch_sub(1, Ordering::SeqCst);

            self.stats
                .task_processed_total
                .fetch_add(1, Ordering::Relaxed);
        }

        if n_pending_frames != 0 {
            self.stats.preemptions.fetch_add(1, Ordering::Relaxed);
        }

        drop(state);

        n_pending_frames == 0 && self.pending_tasks.load(Ordering::SeqCst) != 0
    }

    fn schedule_async_task_processing(&self) {
        let next_frame_deadline = match self.next_frame_deadline.try_load() {
            Some(deadline) => deadline,
            None => return,
        };

        if let Some(guard) = self.scheduler_mutex.try_lock() {
            if self.processing_state.load(Ordering::SeqCst) == PROC_NOT_SCHEDULED {
                let mut deadline = 0;

                if self.config.enable_precise_task_scheduling {
                    let now = self.clock.timestamp_ns();

                    deadline = if now
                        < next_frame_deadline - self.no_task_proc_half_interval
                    {
                        0
                    } else if now < next_frame_deadline + self.no_task_proc_half_interval {
                        // inside the prohibited window: resume just after it
                        next_frame_deadline + self.no_task_proc_half_interval
                    } else {
                        0
                    };
                }

                self.scheduler.schedule_task_processing(deadline);
                self.stats.scheduler_calls.fetch_add(1, Ordering::Relaxed);

                self.processing_state
                    .store(PROC_SCHEDULED, Ordering::SeqCst);
            }

            drop(guard);

            if self.pending_frames.load(Ordering::SeqCst) != 0 {
                self.cancel_async_task_processing();
            }
        }
    }

    fn cancel_async_task_processing(&self) {
        if let Some(_guard) = self.scheduler_mutex.try_lock() {
            if self.processing_state.load(Ordering::SeqCst) == PROC_SCHEDULED {
                self.scheduler.cancel_task_processing();
                self.stats
                    .scheduler_cancellations
                    .fetch_add(1, Ordering::Relaxed);

                self.processing_state
                    .store(PROC_NOT_SCHEDULED, Ordering::SeqCst);
            }
        }
    }

    fn process_task(
        &self,
        state: &mut MutexGuard<'_, PipelineState<B>>,
        task: &Arc<PipelineTask>,
        notify: bool,
    ) {
        let completer = task.take_completer();

        let success = state.backend.process_task(task.as_ref());
        task.finish(success);

        // after the completer returns or the semaphore is posted, the loop
        // must not touch the task again
        if let Some(completer) = completer {
            completer(task.as_ref());
        } else if notify {
            if let Some(sem) = task.take_semaphore() {
                sem.post();
            }
        }
    }

    fn process_next_subframe(
        &self,
        state: &mut MutexGuard<'_, PipelineState<B>>,
        frame: &mut Frame,
        frame_pos: &mut StreamTimestamp,
        frame_duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        let subframe_duration = if self.max_samples_between_tasks != 0 {
            (frame_duration - *frame_pos).min(self.max_samples_between_tasks)
        } else {
            frame_duration
        };

        let code = if subframe_duration == frame_duration {
            // happy path: the sub-frame is the whole frame
            state.backend.process_subframe(frame, frame_duration, mode)
        } else {
            self.make_and_process_subframe(
                state,
                frame,
                frame_duration,
                *frame_pos,
                subframe_duration,
                mode,
            )
        };

        *frame_pos += subframe_duration;

        state.subframe_tasks_deadline =
            self.clock.timestamp_ns() + self.config.max_inframe_task_processing;

        if !state.enough_samples_to_process_tasks {
            state.samples_processed += subframe_duration;
            if state.samples_processed >= self.min_samples_between_tasks {
                state.enough_samples_to_process_tasks = true;
            }
        }

        code
    }

    fn make_and_process_subframe(
        &self,
        state: &mut MutexGuard<'_, PipelineState<B>>,
        frame: &mut Frame,
        frame_duration: StreamTimestamp,
        subframe_pos: StreamTimestamp,
        subframe_duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        let channels = self.sample_spec.num_channels() as usize;

        if self.direction == Direction::ReadFrames && subframe_pos == 0 {
            frame.resize(self.sample_spec.stream_timestamp_to_samples(frame_duration));
        }

        if state.subframe.is_none() {
            state.subframe = Some(state.scratch_factory.allocate_frame()?);
        }
        let mut subframe = state.subframe.take().expect("just ensured");
        subframe.clear();

        let sample_begin = subframe_pos as usize * channels;
        let sample_end = (subframe_pos + subframe_duration) as usize * channels;

        if self.direction == Direction::WriteFrames {
            // propagate meta-data and data of the outer frame to the sub-frame
            subframe.resize(sample_end - sample_begin);
            subframe
                .samples_mut()
                .copy_from_slice(&frame.samples()[sample_begin..sample_end]);
            subframe.set_flags(frame.flags());
            subframe.set_duration(subframe_duration);
            if frame.has_capture_timestamp() {
                subframe.set_capture_timestamp(
                    frame.capture_timestamp()
                        + self.sample_spec.stream_timestamp_to_ns(subframe_pos),
                );
            }
        }

        let code = state
            .backend
            .process_subframe(&mut subframe, subframe_duration, mode);

        if self.direction == Direction::ReadFrames && code.is_ok() {
            // propagate meta-data and data of the sub-frame to the outer frame
            frame.samples_mut()[sample_begin..sample_end]
                .copy_from_slice(&subframe.samples()[..sample_end - sample_begin]);
            frame.add_flags(subframe.flags());
            frame.set_duration(subframe_pos + subframe_duration);
            if subframe_pos == 0 {
                frame.set_capture_timestamp(subframe.capture_timestamp());
            }
        }

        subframe.clear();
        state.subframe = Some(subframe);

        code
    }

    fn start_subframe_task_processing(
        state: &mut MutexGuard<'_, PipelineState<B>>,
        pending_tasks: usize,
    ) -> bool {
        if pending_tasks == 0 {
            return false;
        }

        if !state.enough_samples_to_process_tasks {
            return false;
        }

        state.enough_samples_to_process_tasks = false;
        state.samples_processed = 0;

        true
    }

    fn subframe_task_processing_allowed(
        &self,
        state: &MutexGuard<'_, PipelineState<B>>,
        next_frame_deadline: i64,
    ) -> bool {
        let now = self.clock.timestamp_ns();

        if now >= state.subframe_tasks_deadline {
            return false;
        }

        now < next_frame_deadline - self.no_task_proc_half_interval
    }

    fn interframe_task_processing_allowed(&self, next_frame_deadline: i64) -> bool {
        if !self.config.enable_precise_task_scheduling {
            return true;
        }

        if let Some(frame_tid) = self.frame_processing_tid.try_load() {
            if frame_tid == 0 {
                // no frames were processed yet; all tasks run in place
                return true;
            }
            if frame_tid == self.clock.tid() {
                // the frame thread is the caller, so it cannot be blocked
                // by in-place work on its own behalf
                return true;
            }
        }

        let now = self.clock.timestamp_ns();

        now < next_frame_deadline - self.no_task_proc_half_interval
            || now >= next_frame_deadline + self.no_task_proc_half_interval
    }

    fn report_stats(&self) {
        if !self.report_limiter.would_allow() {
            return;
        }

        if let Some(_guard) = self.scheduler_mutex.try_lock() {
            if self.report_limiter.allow() {
                if let Ok(snapshot) = serde_json::to_string(&self.stats()) {
                    log::debug!("[Pipeline] stats={snapshot}");
                }
            }
        }
    }
}

impl<B: PipelineBackend> Drop for PipelineLoop<B> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(
                self.pending_tasks.load(Ordering::SeqCst),
                0,
                "pipeline loop: attempt to destroy pipeline before finishing all tasks"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize};

    struct TestClock {
        now: AtomicI64,
        tid: AtomicU64,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: AtomicI64::new(1_000_000),
                tid: AtomicU64::new(0),
            })
        }
    }

    impl PipelineClock for TestClock {
        fn timestamp_ns(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn tid(&self) -> u64 {
            let tid = self.tid.load(Ordering::SeqCst);
            if tid != 0 {
                tid
            } else {
                time::thread_id()
            }
        }
    }

    #[derive(Default)]
    struct MockScheduler {
        scheduled: AtomicUsize,
        cancelled: AtomicUsize,
        last_deadline: AtomicI64,
    }

    impl TaskScheduler for MockScheduler {
        fn schedule_task_processing(&self, deadline_ns: i64) {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            self.last_deadline.store(deadline_ns, Ordering::SeqCst);
        }

        fn cancel_task_processing(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingBackend {
        subframe_calls: usize,
        subframe_durations: Vec<StreamTimestamp>,
        task_calls: usize,
        fail_subframe_at: Option<usize>,
        fail_tasks: bool,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                subframe_calls: 0,
                subframe_durations: Vec::new(),
                task_calls: 0,
                fail_subframe_at: None,
                fail_tasks: false,
            }
        }
    }

    impl PipelineBackend for CountingBackend {
        fn process_subframe(
            &mut self,
            frame: &mut Frame,
            duration: StreamTimestamp,
            _mode: FrameMode,
        ) -> Result<()> {
            self.subframe_calls += 1;
            self.subframe_durations.push(duration);
            if self.fail_subframe_at == Some(self.subframe_calls) {
                return Err(crate::error::Error::Failure);
            }
            frame.resize(duration as usize);
            frame.set_duration(duration);
            Ok(())
        }

        fn process_task(&mut self, _task: &PipelineTask) -> bool {
            self.task_calls += 1;
            !self.fail_tasks
        }
    }

    // 1 kHz mono so that 1 tick = 1 ms
    fn spec() -> SampleSpec {
        SampleSpec::new(1000, 1).unwrap()
    }

    fn make_loop(
        backend: CountingBackend,
        scheduler: Arc<MockScheduler>,
        clock: Arc<TestClock>,
        config: PipelineLoopConfig,
    ) -> PipelineLoop<CountingBackend> {
        PipelineLoop::new(
            backend,
            scheduler,
            clock,
            config,
            spec(),
            Direction::ReadFrames,
        )
    }

    fn read_frame(
        pipeline: &PipelineLoop<CountingBackend>,
        duration: StreamTimestamp,
    ) -> Result<()> {
        let factory = FrameFactory::new(1);
        let mut frame = factory.allocate_frame().unwrap();
        pipeline.process_subframes_and_tasks(&mut frame, duration, FrameMode::Hard)
    }

    #[test]
    fn schedules_task_in_place_before_first_frame() {
        let scheduler = Arc::new(MockScheduler::default());
        let pipeline = make_loop(
            CountingBackend::new(),
            scheduler.clone(),
            TestClock::new(),
            PipelineLoopConfig::default(),
        );

        let task = PipelineTask::new();
        assert!(pipeline.schedule_and_wait(task.clone()));
        assert!(task.is_finished());
        assert_eq!(pipeline.stats().task_processed_in_place, 1);
        assert_eq!(pipeline.num_pending_tasks(), 0);
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completer_runs_after_finish() {
        let scheduler = Arc::new(MockScheduler::default());
        let pipeline = make_loop(
            CountingBackend::new(),
            scheduler,
            TestClock::new(),
            PipelineLoopConfig::default(),
        );

        let observed = Arc::new(AtomicBool::new(false));
        let observed2 = observed.clone();
        let task = PipelineTask::new();
        pipeline.schedule(task.clone(), move |task| {
            assert!(task.is_finished());
            observed2.store(true, Ordering::SeqCst);
        });
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn frame_larger_than_max_is_split_into_subframes() {
        let scheduler = Arc::new(MockScheduler::default());
        let mut config = PipelineLoopConfig::default();
        // at 1 kHz, 1 ms = 1 sample per sub-frame
        config.max_frame_length_between_tasks = time::MILLISECOND;
        config.min_frame_length_between_tasks = 0;

        let pipeline = make_loop(
            CountingBackend::new(),
            scheduler,
            TestClock::new(),
            config,
        );

        assert!(read_frame(&pipeline, 5).is_ok());
        let state = pipeline.state.lock();
        assert_eq!(state.backend.subframe_calls, 5);
        assert!(state.backend.subframe_durations.iter().all(|&d| d == 1));
    }

    #[test]
    fn subframe_count_is_duration_ceil_div_max() {
        let scheduler = Arc::new(MockScheduler::default());
        let mut config = PipelineLoopConfig::default();
        config.max_frame_length_between_tasks = 2 * time::MILLISECOND;

        let pipeline = make_loop(
            CountingBackend::new(),
            scheduler,
            TestClock::new(),
            config,
        );

        assert!(read_frame(&pipeline, 5).is_ok());
        let state = pipeline.state.lock();
        // ceil(5 / 2) = 3 sub-frames: 2 + 2 + 1
        assert_eq!(state.backend.subframe_calls, 3);
        assert_eq!(state.backend.subframe_durations, vec![2, 2, 1]);
    }

    #[test]
    fn zero_duration_frame_produces_no_split() {
        let scheduler = Arc::new(MockScheduler::default());
        let pipeline = make_loop(
            CountingBackend::new(),
            scheduler,
            TestClock::new(),
            PipelineLoopConfig::default(),
        );

        assert!(read_frame(&pipeline, 0).is_ok());
        let state = pipeline.state.lock();
        assert_eq!(state.backend.subframe_calls, 1);
        assert_eq!(state.backend.subframe_durations, vec![0]);
    }

    #[test]
    fn subframe_failure_stops_the_frame() {
        let scheduler = Arc::new(MockScheduler::default());
        let mut config = PipelineLoopConfig::default();
        config.max_frame_length_between_tasks = time::MILLISECOND;

        let mut backend = CountingBackend::new();
        backend.fail_subframe_at = Some(2);

        let pipeline = make_loop(backend, scheduler, TestClock::new(), config);

        assert!(read_frame(&pipeline, 5).is_err());
        let state = pipeline.state.lock();
        assert_eq!(
            state.backend.subframe_calls, 2,
            "remaining sub-frames must not be processed"
        );
    }

    #[test]
    fn task_failure_does_not_abort_the_loop() {
        let scheduler = Arc::new(MockScheduler::default());
        let mut backend = CountingBackend::new();
        backend.fail_tasks = true;

        let pipeline = make_loop(
            backend,
            scheduler,
            TestClock::new(),
            PipelineLoopConfig::default(),
        );

        let task = PipelineTask::new();
        assert!(!pipeline.schedule_and_wait(task.clone()));
        assert!(task.is_finished());
        assert!(!task.success());

        // the loop stays usable
        assert!(pipeline.schedule_and_wait(PipelineTask::new()) == false);
        assert!(read_frame(&pipeline, 1).is_ok());
    }

    #[test]
    fn tasks_scheduled_from_other_thread_in_prohibited_window_are_deferred() {
        let clock = TestClock::new();
        let scheduler = Arc::new(MockScheduler::default());
        let pipeline = Arc::new(make_loop(
            CountingBackend::new(),
            scheduler.clone(),
            clock.clone(),
            PipelineLoopConfig::default(),
        ));

        // process one frame so that a deadline and frame tid are recorded
        clock.now.store(time::SECOND, Ordering::SeqCst);
        assert!(read_frame(&pipeline, 5).is_ok());

        // move the clock inside the prohibited window around the predicted
        // next frame deadline (frame start + 5 ms)
        clock
            .now
            .store(time::SECOND + 5 * time::MILLISECOND, Ordering::SeqCst);

        // pretend the scheduling thread is a different one
        clock.tid.store(0xDEAD, Ordering::SeqCst);
        let frame_tid = time::thread_id();
        assert_ne!(frame_tid, 0xDEAD);

        // the frame tid recorded by read_frame equals this thread's real id,
        // so fake a different tid for the in-place check
        let task = PipelineTask::new();
        pipeline.schedule(task.clone(), |_| {});

        // deferred: not executed in place, external processing armed
        assert!(!task.is_finished());
        assert_eq!(pipeline.num_pending_tasks(), 1);
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 1);
        // the hinted deadline lies just past the prohibited window
        let deadline = scheduler.last_deadline.load(Ordering::SeqCst);
        assert!(deadline > time::SECOND + 5 * time::MILLISECOND);

        // the scheduler fires later, outside the window
        clock
            .now
            .store(time::SECOND + 20 * time::MILLISECOND, Ordering::SeqCst);
        pipeline.process_tasks();
        assert!(task.is_finished());
        assert_eq!(pipeline.num_pending_tasks(), 0);
    }

    #[test]
    fn frame_caller_drains_queued_tasks_between_subframes() {
        let clock = TestClock::new();
        let scheduler = Arc::new(MockScheduler::default());
        let mut config = PipelineLoopConfig::default();
        config.max_frame_length_between_tasks = time::MILLISECOND;
        config.min_frame_length_between_tasks = time::MILLISECOND;

        let pipeline = Arc::new(make_loop(
            CountingBackend::new(),
            scheduler,
            clock.clone(),
            config,
        ));

        // record a frame so the deadline exists, then jam the clock inside
        // the prohibited window and schedule from a foreign thread id so the
        // tasks stay queued
        clock.now.store(time::SECOND, Ordering::SeqCst);
        assert!(read_frame(&pipeline, 5).is_ok());
        clock
            .now
            .store(time::SECOND + 5 * time::MILLISECOND, Ordering::SeqCst);
        clock.tid.store(0xBEEF, Ordering::SeqCst);

        for _ in 0..3 {
            pipeline.schedule(PipelineTask::new(), |_| {});
        }
        assert_eq!(pipeline.num_pending_tasks(), 3);

        // the next frame drains them between sub-frames
        clock.tid.store(0, Ordering::SeqCst);
        clock
            .now
            .store(time::SECOND + 100 * time::MILLISECOND, Ordering::SeqCst);
        assert!(read_frame(&pipeline, 5).is_ok());

        assert_eq!(pipeline.num_pending_tasks(), 0);
        assert!(pipeline.stats().task_processed_in_frame >= 3);
    }
}
