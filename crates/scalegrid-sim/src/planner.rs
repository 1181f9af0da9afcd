//! Planner: the request entry point.
//!
//! `Planner::plan` runs one scaling advice request end to end and
//! guarantees exactly one terminal [`ScalingPlanResult`] on the result
//! channel, whether the simulation succeeded, failed or was cancelled.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, Span, info, info_span, warn};

use scalegrid_placement::{InstancePricingAccess, ResourceWeights};
use scalegrid_scheduler::{BinPackScheduler, CancelToken, SchedulerLauncher};
use scalegrid_state::{ScalingAdviceRequest, ScaleOutPlan, SimulationStrategy};

use crate::config::{AdvisorConfig, SimulationSettings};
use crate::error::{AdviceError, SimResult, SimulationError};
use crate::plan::ScalingPlanResult;
use crate::simulator::{MultiSimulationsPerGroup, ScaleOutSimulator};
use crate::trace::TraceLog;

/// Long-lived collaborators shared by every request.
#[derive(Clone)]
pub struct PlannerDeps {
    pub launcher: Arc<SchedulerLauncher>,
    pub pricing: Arc<dyn InstancePricingAccess>,
    pub weights: Arc<dyn ResourceWeights>,
    pub settings: SimulationSettings,
}

pub struct Planner {
    deps: PlannerDeps,
}

impl Planner {
    pub fn new(deps: PlannerDeps) -> Self {
        Self { deps }
    }

    /// Build a planner with a bin-pack launcher sized from `config`.
    pub fn from_config(
        config: &AdvisorConfig,
        pricing: Arc<dyn InstancePricingAccess>,
    ) -> anyhow::Result<Self> {
        let settings = config.settings()?;
        let launcher = Arc::new(SchedulerLauncher::new(
            settings.max_parallel,
            Arc::new(BinPackScheduler),
        ));
        Ok(Self::new(PlannerDeps {
            launcher,
            pricing,
            weights: Arc::new(config.weights.clone()),
            settings,
        }))
    }

    pub fn launcher(&self) -> &Arc<SchedulerLauncher> {
        &self.deps.launcher
    }

    /// Run `request`, sending partial results (incremental mode) and then
    /// exactly one terminal result on `results`.
    pub async fn plan(
        &self,
        request: ScalingAdviceRequest,
        cancel: &CancelToken,
        results: &mpsc::Sender<ScalingPlanResult>,
    ) {
        let request = Arc::new(request);
        let trace = self.open_trace_log(&request);

        let outcome = match &trace {
            Some(log) => {
                let span = tracing::dispatcher::with_default(log.dispatch(), || {
                    request_span(&request)
                });
                self.run(Arc::clone(&request), cancel, results)
                    .instrument(span)
                    .with_subscriber(log.dispatch().clone())
                    .await
            }
            None => {
                self.run(Arc::clone(&request), cancel, results)
                    .instrument(request_span(&request))
                    .await
            }
        };
        let trace_log_path = trace.as_ref().map(|log| log.path().to_path_buf());
        drop(trace);

        let outcome = outcome.map_err(|source| AdviceError {
            request_id: request.id.clone(),
            correlation_id: request.correlation_id.clone(),
            source,
        });
        match &outcome {
            Ok(plan) => info!(
                request_id = %request.id,
                correlation_id = %request.correlation_id,
                items = plan.items.len(),
                nodes = plan.total_delta(),
                "scaling advice produced"
            ),
            Err(e) => warn!(error = %e, "scaling advice failed"),
        }

        let terminal = ScalingPlanResult {
            name: request.id.clone(),
            labels: request.labels.clone(),
            outcome,
            terminal: true,
            trace_log_path,
        };
        if results.send(terminal).await.is_err() {
            warn!(request_id = %request.id, "result receiver dropped before terminal result");
        }
    }

    async fn run(
        &self,
        request: Arc<ScalingAdviceRequest>,
        cancel: &CancelToken,
        results: &mpsc::Sender<ScalingPlanResult>,
    ) -> SimResult<ScaleOutPlan> {
        match request.simulation_strategy {
            SimulationStrategy::MultiSimulationsPerGroup => {
                let simulator = MultiSimulationsPerGroup::new(
                    request,
                    Arc::clone(&self.deps.launcher),
                    Arc::clone(&self.deps.pricing),
                    Arc::clone(&self.deps.weights),
                    self.deps.settings.clone(),
                )?;
                simulator.simulate(cancel, results).await
            }
            SimulationStrategy::SingleSimulationPerGroup => Err(SimulationError::Unimplemented(
                format!("simulation strategy {}", SimulationStrategy::SingleSimulationPerGroup),
            )),
        }
    }

    fn open_trace_log(&self, request: &ScalingAdviceRequest) -> Option<TraceLog> {
        if request.diagnostic_verbosity == 0 {
            return None;
        }
        match TraceLog::create(
            &self.deps.settings.trace_dir,
            &request.id,
            &request.correlation_id,
        ) {
            Ok(log) => {
                info!(request_id = %request.id, path = %log.path().display(), "diagnostic trace enabled");
                Some(log)
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "continuing without diagnostic trace");
                None
            }
        }
    }
}

fn request_span(request: &ScalingAdviceRequest) -> Span {
    info_span!(
        "scaling_advice",
        request_id = %request.id,
        correlation_id = %request.correlation_id
    )
}

/// Parse a strategy name as used in requests and on the command line.
pub fn parse_simulation_strategy(name: &str) -> SimResult<SimulationStrategy> {
    match name.trim() {
        "multi_simulations_per_group" | "multi-simulations-per-group" => {
            Ok(SimulationStrategy::MultiSimulationsPerGroup)
        }
        "single_simulation_per_group" | "single-simulation-per-group" => {
            Ok(SimulationStrategy::SingleSimulationPerGroup)
        }
        other => Err(SimulationError::UnsupportedSimulationStrategy(other.to_string())),
    }
}
