//! Worker system: isolated processes that run one engine call at a time.
//!
//! Core components:
//! - `runtime`: the loop inside each worker process
//! - `launcher`: how the pool starts a worker (`ProcessLauncher` for real binaries)
//! - `handle`: the manager-side proxy for one slot (pipes, liveness, generation)
//! - `state`: worker state machine (starting → ready ⇄ busy → terminating → terminated)

pub mod handle;
pub mod launcher;
pub mod runtime;
pub mod state;

pub use handle::{SignalKind, WorkerHandle, WorkerSignal};
pub use launcher::{ProcessLauncher, WorkerLauncher, WorkerProcess};
pub use runtime::{WorkerRuntime, describe_panic};
pub use state::{WorkerId, WorkerState};
