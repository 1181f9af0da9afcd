//! Scale-out simulator: pass orchestration across simulation groups.
//!
//! Groups are visited in ascending priority. Within a group, passes repeat
//! while each pass produces a winner that shrinks the set of pending
//! workloads; the winner's view becomes the base of the next pass and of
//! the next group. The simulator stops once nothing is left pending.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use scalegrid_placement::{
    InstancePricingAccess, NodeScore, NodeScoreSelector, NodeScorer, ResourceWeights,
    scorer_for, selector_for,
};
use scalegrid_scheduler::{CancelToken, SchedulerLauncher};
use scalegrid_state::{
    AdviceGenerationMode, NodePool, ScalingAdviceRequest, ScaleOutPlan, View, ViewAccess,
    WorkloadKey,
};

use crate::config::SimulationSettings;
use crate::error::{SimResult, SimulationError};
use crate::group::{PassEnv, SimulationGroup, build_groups};
use crate::plan::{ScalingPlanResult, build_plan};

/// Consecutive passes without progress after which a group is abandoned.
const MAX_STALLED_PASSES: u32 = 2;

/// Produces a scale-out plan for one request.
pub trait ScaleOutSimulator: Send + Sync {
    /// Run the simulation. Non-terminal partial plans may be sent on
    /// `results`; the terminal result is left to the caller.
    fn simulate(
        &self,
        cancel: &CancelToken,
        results: &mpsc::Sender<ScalingPlanResult>,
    ) -> impl Future<Output = SimResult<ScaleOutPlan>> + Send;
}

/// Runs every candidate of a group concurrently in each pass.
pub struct MultiSimulationsPerGroup {
    request: Arc<ScalingAdviceRequest>,
    views: ViewAccess,
    launcher: Arc<SchedulerLauncher>,
    scorer: Box<dyn NodeScorer>,
    selector: Box<dyn NodeScoreSelector>,
    pass_counter: Arc<AtomicU32>,
    rng: Mutex<StdRng>,
    settings: SimulationSettings,
}

impl MultiSimulationsPerGroup {
    /// Replays the request's snapshot into a fresh base view.
    pub fn new(
        request: Arc<ScalingAdviceRequest>,
        launcher: Arc<SchedulerLauncher>,
        pricing: Arc<dyn InstancePricingAccess>,
        weights: Arc<dyn ResourceWeights>,
        settings: SimulationSettings,
    ) -> SimResult<Self> {
        let base = View::new_base(&format!("base-{}", request.id));
        base.load_snapshot(&request.snapshot)
            .map_err(|e| SimulationError::CreateSimulator(e.to_string()))?;

        let scorer = scorer_for(request.scoring_strategy, pricing, weights);
        let selector = selector_for(request.scoring_strategy, scorer.preference());
        let rng = match settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            request,
            views: ViewAccess::new(base),
            launcher,
            scorer,
            selector,
            pass_counter: Arc::new(AtomicU32::new(0)),
            rng: Mutex::new(rng),
            settings,
        })
    }

    /// Passes started so far.
    pub fn passes(&self) -> u32 {
        self.pass_counter.load(Ordering::SeqCst)
    }

    fn within_quota(&self, pool: &NodePool, winners: &HashMap<String, u32>) -> bool {
        let Some(max) = pool.max_nodes else {
            return true;
        };
        let existing = pool.member_count(&self.request.snapshot.nodes) as u32;
        existing + winners.get(&pool.name).copied().unwrap_or(0) < max
    }

    async fn emit_partial(
        &self,
        results: &mpsc::Sender<ScalingPlanResult>,
        winners: &[NodeScore],
        leftover: &BTreeSet<WorkloadKey>,
    ) {
        let plan = build_plan(&self.request.snapshot.nodes, winners, leftover);
        let message = ScalingPlanResult {
            name: self.request.id.clone(),
            labels: self.request.labels.clone(),
            outcome: Ok(plan),
            terminal: false,
            trace_log_path: None,
        };
        if results.send(message).await.is_err() {
            debug!(request = %self.request.id, "result receiver dropped, partial plan discarded");
        }
    }

    /// Run passes of `group` until it stops making progress. Returns true
    /// once nothing is left pending.
    async fn run_group(
        &self,
        group: &SimulationGroup,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> SimResult<bool> {
        let env = PassEnv {
            views: &self.views,
            launcher: &self.launcher,
            pass_counter: &self.pass_counter,
            settings: &self.settings,
            cancel,
        };
        let mut stalled = 0;

        loop {
            if let Some(cause) = cancel.cause() {
                return Err(SimulationError::Cancelled(cause));
            }
            let pass = self.pass_counter.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(pass, priority = group.priority, pending = progress.pending.len(), "pass started");

            let quota_snapshot = progress.per_pool.clone();
            let result = group
                .run_pass(&env, &progress.base, |pool| self.within_quota(pool, &quota_snapshot))
                .await?;
            if result.nothing_pending {
                progress.pending.clear();
                return Ok(true);
            }

            let scores = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                group.score(&result, self.scorer.as_ref(), self.selector.as_ref(), &mut rng)
            };
            let scores = match scores {
                Ok(scores) => scores,
                Err(e) => {
                    result.release_views(&self.views, None);
                    return Err(e);
                }
            };

            let Some(winner) = scores.winner else {
                debug!(pass, priority = group.priority, "no winner, leaving group");
                result.release_views(&self.views, None);
                return Ok(false);
            };

            let leftover: BTreeSet<WorkloadKey> = winner.unscheduled.iter().cloned().collect();
            if leftover.len() >= progress.pending.len() {
                stalled += 1;
                debug!(pass, winner = %winner.name, stalled, "winner made no progress");
                result.release_views(&self.views, None);
                if stalled >= MAX_STALLED_PASSES {
                    return Ok(false);
                }
                continue;
            }
            stalled = 0;

            let Some(winner_view) = result.view_of(&winner.name) else {
                result.release_views(&self.views, None);
                return Err(SimulationError::NoWinningNodeScore);
            };
            let scaled_up = result.used_scaled_node(&winner.name);
            result.release_views(&self.views, Some(&winner.name));
            progress.base = winner_view;

            info!(
                pass,
                winner = %winner.name,
                value = winner.value,
                scaled_up,
                placed = progress.pending.len() - leftover.len(),
                leftover = leftover.len(),
                "pass winner recorded"
            );
            progress.pending = leftover;
            if scaled_up {
                *progress
                    .per_pool
                    .entry(winner.placement.node_pool.clone())
                    .or_default() += 1;
                progress.winners.push(winner);
            } else {
                // Everything it placed fit on nodes that already exist.
                progress.placed_in_place = true;
            }

            if progress.pending.is_empty() {
                return Ok(true);
            }
        }
    }
}

/// Running state of one `simulate` call.
struct Progress {
    base: Arc<View>,
    pending: BTreeSet<WorkloadKey>,
    /// Winners that add a node, in pass order.
    winners: Vec<NodeScore>,
    per_pool: HashMap<String, u32>,
    /// Set once a winner placed work without adding a node.
    placed_in_place: bool,
}

impl ScaleOutSimulator for MultiSimulationsPerGroup {
    async fn simulate(
        &self,
        cancel: &CancelToken,
        results: &mpsc::Sender<ScalingPlanResult>,
    ) -> SimResult<ScaleOutPlan> {
        let base = self.views.base_view();
        let pending: BTreeSet<WorkloadKey> =
            base.unscheduled_workloads()?.iter().map(|w| w.key()).collect();
        if pending.is_empty() {
            info!(request = %self.request.id, "no unscheduled workloads, nothing to scale");
            return Ok(ScaleOutPlan::default());
        }

        let groups = build_groups(&self.request.constraint);
        info!(
            request = %self.request.id,
            groups = groups.len(),
            pending = pending.len(),
            "scale-out simulation started"
        );

        let mut progress = Progress {
            base,
            pending,
            winners: Vec::new(),
            per_pool: HashMap::new(),
            placed_in_place: false,
        };
        for group in &groups {
            let first_winner = progress.winners.len();
            let done = self.run_group(group, cancel, &mut progress).await?;

            if self.request.advice_generation_mode == AdviceGenerationMode::Incremental
                && progress.winners.len() > first_winner
            {
                self.emit_partial(results, &progress.winners[first_winner..], &progress.pending)
                    .await;
            }
            if done {
                break;
            }
        }

        if progress.winners.is_empty() && !progress.placed_in_place {
            return Err(SimulationError::NoScalingAdvice);
        }
        let plan = build_plan(&self.request.snapshot.nodes, &progress.winners, &progress.pending);
        info!(
            request = %self.request.id,
            passes = self.passes(),
            nodes = plan.total_delta(),
            unsatisfied = plan.unsatisfied_workload_names.len(),
            "scale-out simulation finished"
        );
        Ok(plan)
    }
}
