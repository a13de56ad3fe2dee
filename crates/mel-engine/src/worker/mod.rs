//! Worker pool and queue polling

mod poller;
mod pool;

pub use poller::{PollerConfig, StepPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
