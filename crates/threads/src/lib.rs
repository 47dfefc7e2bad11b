//! Thread plumbing for the compositor: tile worker pools, the dedicated compositing run
//! loop, and the feedback channel back to the controlling thread.

mod feedback;
mod pool;
mod run_loop;

pub use feedback::{FeedbackConsumer, FeedbackProducer, feedback_channel};
pub use frame_scheduler::{ScheduleOutcome, SchedulerState};
pub use pool::{PoolOccupancy, PoolSizes, WorkerPool, WorkerPoolPair};
pub use run_loop::{CompositingRunLoop, RunLoopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Cpu,
    Gpu,
}

#[derive(Debug, thiserror::Error)]
pub enum RunLoopError {
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("run loop has stopped")]
    Stopped,
    #[error("synchronous task posted from the run loop's own thread")]
    Reentrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PostTaskError {
    #[error("no {0:?} worker pool is configured")]
    PoolMissing(PoolKind),
    #[error("{0:?} worker pool has shut down")]
    PoolClosed(PoolKind),
}
