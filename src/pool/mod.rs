//! Worker pool: fixed set of worker slots fed from a FIFO job queue.

pub mod job;
pub mod manager;
pub mod queue;

pub use job::{Job, JobEvent, JobEventKind, JobState};
pub use manager::{JobListener, PoolHandle, PoolStatus, ShutdownReport, WorkerSnapshot};
pub use queue::JobQueue;
