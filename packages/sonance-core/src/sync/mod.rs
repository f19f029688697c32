//! Concurrency primitives shared by the pipeline, control and network loops.

mod mpsc_queue;
mod rate_limiter;
mod semaphore;
mod seqlock;
mod timer;

pub use mpsc_queue::{HasMpscNode, MpscNode, MpscQueue};
pub use rate_limiter::RateLimiter;
pub use semaphore::Semaphore;
pub use seqlock::{SeqValue, Seqlock};
pub use timer::Timer;
