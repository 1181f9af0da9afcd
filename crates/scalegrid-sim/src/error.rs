//! Simulation and advice error types.

use std::path::PathBuf;

use thiserror::Error;

use scalegrid_placement::ScoreError;
use scalegrid_scheduler::SchedulerError;
use scalegrid_state::StateError;

/// Errors that can occur while simulating scale-out.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("failed to create simulation {name}: {source}")]
    CreateSimulation {
        name: String,
        source: Box<SimulationError>,
    },

    #[error("node template {template} not found in node pool {pool}")]
    TemplateNotFound { pool: String, template: String },

    #[error("no unscheduled workloads")]
    NoUnscheduledWorkloads,

    #[error("failed to run simulation {name}: {source}")]
    RunSimulation {
        name: String,
        source: Box<SimulationError>,
    },

    #[error("simulation {0} timed out")]
    SimulationTimeout(String),

    #[error("failed to launch scheduler: {0}")]
    LaunchScheduler(#[source] SchedulerError),

    #[error("failed to compute node score for {name}: {source}")]
    ComputeNodeScore { name: String, source: ScoreError },

    #[error("failed to select node score: {0}")]
    SelectNodeScore(#[source] ScoreError),

    #[error("no winning node score")]
    NoWinningNodeScore,

    #[error("no scaling advice could be produced")]
    NoScalingAdvice,

    #[error("unsupported simulation strategy: {0}")]
    UnsupportedSimulationStrategy(String),

    #[error("failed to create simulator: {0}")]
    CreateSimulator(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("failed to open trace log {path}: {source}")]
    TraceLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("view error: {0}")]
    View(#[from] StateError),
}

impl SimulationError {
    /// True for `NoUnscheduledWorkloads`, bare or as a creation cause.
    pub fn is_no_unscheduled_workloads(&self) -> bool {
        match self {
            SimulationError::NoUnscheduledWorkloads => true,
            SimulationError::CreateSimulation { source, .. } => source.is_no_unscheduled_workloads(),
            _ => false,
        }
    }
}

pub type SimResult<T> = Result<T, SimulationError>;

/// A [`SimulationError`] tagged with the request it belongs to.
#[derive(Debug, Error)]
#[error("scaling advice request {request_id} (correlation {correlation_id}) failed: {source}")]
pub struct AdviceError {
    pub request_id: String,
    pub correlation_id: String,
    pub source: SimulationError,
}
