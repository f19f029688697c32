//! Task-based pipelines: a threadless cooperative scheduler that serializes
//! real-time frame processing with best-effort control tasks.

mod pipeline_loop;
mod task;

pub use pipeline_loop::{
    Direction, PipelineBackend, PipelineClock, PipelineLoop, PipelineLoopConfig, RealClock,
    StatsSnapshot, TaskScheduler,
};
pub use task::PipelineTask;
