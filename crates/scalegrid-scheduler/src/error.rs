//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while launching or running a scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to launch scheduler for {name}: {reason}")]
    LaunchScheduler { name: String, reason: String },

    #[error("scheduler task for {name} failed: {reason}")]
    TaskFailed { name: String, reason: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("view error: {0}")]
    View(#[from] scalegrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
