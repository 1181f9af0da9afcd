//! scalegrid-scheduler: an in-process scheduler that binds pending
//! workloads inside a view.
//!
//! Each simulation gets its own scheduler instance, attached to the
//! simulation's sandbox view. The launcher bounds how many run at once.
//!
//! # Architecture
//!
//! ```text
//! SchedulerLauncher (Semaphore, max_parallel permits)
//!   └── launch() -> SchedulerHandle
//!         ├── OwnedSemaphorePermit (released on stop/drop)
//!         └── scheduling loop task
//!               ├── SchedulingAlgorithm::run_cycle (bind / report)
//!               └── wake on watch event, resync tick, stop, cancel
//! ```
//!
//! # Components
//!
//! - **`cancel`**: hierarchical cancellation with deadlines and causes
//! - **`algorithm`**: the scheduling algorithm trait and a bin-pack implementation
//! - **`launcher`**: bounded launcher and the handle that stops a scheduler

pub mod algorithm;
pub mod cancel;
pub mod error;
pub mod launcher;

pub use algorithm::{BinPackScheduler, CycleOutcome, CycleState, SchedulingAlgorithm};
pub use cancel::CancelToken;
pub use error::{SchedulerError, SchedulerResult};
pub use launcher::{LaunchParams, SchedulerHandle, SchedulerLauncher};
