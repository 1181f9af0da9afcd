//! scalegrid-sim: multi-pass scale-out simulation and advice planning.
//!
//! Given a cluster snapshot with pending workloads and a set of node pools,
//! the simulator repeatedly tries one extra node per (pool, template, zone)
//! candidate in isolated views, lets an in-process scheduler place the
//! pending workloads, scores the outcomes and keeps the winner. The winners
//! of all passes form a [`ScaleOutPlan`](scalegrid_state::ScaleOutPlan).
//!
//! # Architecture
//!
//! ```text
//! Planner::plan(request)
//!   └── MultiSimulationsPerGroup::simulate
//!         └── per priority group, per pass
//!               ├── SimulationGroup::run_pass (JoinSet of Simulations)
//!               │     └── Simulation::run (synthetic node + scheduler in a sandbox view)
//!               ├── SimulationGroup::score (NodeScorer + NodeScoreSelector)
//!               └── promote the winner's view to the next pass's base
//! ```
//!
//! # Components
//!
//! - **`config`**: `AdvisorConfig` loaded from TOML, and the derived settings
//! - **`simulation`**: one trial of one candidate node
//! - **`group`**: candidates of one priority tier, one pass at a time
//! - **`simulator`**: pass orchestration across groups
//! - **`plan`**: plan assembly and the result channel message
//! - **`planner`**: request entry point with the terminal-result guarantee
//! - **`trace`**: per-request diagnostic log file

pub mod config;
pub mod error;
pub mod group;
pub mod plan;
pub mod planner;
pub mod simulation;
pub mod simulator;
pub mod trace;

pub use config::{AdvisorConfig, SimulationSettings, parse_duration};
pub use error::{AdviceError, SimResult, SimulationError};
pub use group::{Candidate, SimulationGroup, SimulationGroupResult, SimulationGroupScores, build_groups};
pub use plan::{ScalingPlanResult, build_plan};
pub use planner::{Planner, PlannerDeps, parse_simulation_strategy};
pub use simulation::{Simulation, SimulationArgs, SimulationResult, SimulationStatus};
pub use simulator::{MultiSimulationsPerGroup, ScaleOutSimulator};
pub use trace::TraceLog;
