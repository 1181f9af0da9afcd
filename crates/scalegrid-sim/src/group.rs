//! Simulation groups: the candidates of one priority tier.
//!
//! Node pools are bucketed by ascending `priority`. Each group holds one
//! candidate per pool × template × zone and is simulated pass by pass; all
//! candidates of a pass run concurrently in their own sandbox views over
//! the same base view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use scalegrid_placement::{NodeScore, NodeScoreSelector, NodeScorer, ScoringArgs};
use scalegrid_scheduler::{CancelToken, SchedulerLauncher};
use scalegrid_state::{NodePool, ScalingConstraint, View, ViewAccess};

use crate::config::SimulationSettings;
use crate::error::{SimResult, SimulationError};
use crate::simulation::{Simulation, SimulationArgs, SimulationStatus};

/// How long cancelled simulations get to wind down before being aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// One (pool, template, zone) combination.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_pool: Arc<NodePool>,
    pub template_name: String,
    pub zone: String,
}

impl Candidate {
    pub fn name(&self) -> String {
        format!("{}/{}/{}", self.node_pool.name, self.template_name, self.zone)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationGroup {
    pub priority: i32,
    pub candidates: Vec<Candidate>,
}

/// Bucket the constraint's pools into groups, lowest priority value first.
/// Within a group, candidates keep the pool/template/zone declaration order.
pub fn build_groups(constraint: &ScalingConstraint) -> Vec<SimulationGroup> {
    let mut by_priority: BTreeMap<i32, Vec<Candidate>> = BTreeMap::new();
    for pool in &constraint.node_pools {
        let pool = Arc::new(pool.clone());
        let candidates = by_priority.entry(pool.priority).or_default();
        for template in &pool.node_templates {
            for zone in &pool.zones {
                candidates.push(Candidate {
                    node_pool: Arc::clone(&pool),
                    template_name: template.name.clone(),
                    zone: zone.clone(),
                });
            }
        }
    }
    by_priority
        .into_iter()
        .filter(|(_, candidates)| !candidates.is_empty())
        .map(|(priority, candidates)| SimulationGroup {
            priority,
            candidates,
        })
        .collect()
}

/// Shared collaborators of every pass.
pub struct PassEnv<'a> {
    pub views: &'a ViewAccess,
    pub launcher: &'a Arc<SchedulerLauncher>,
    pub pass_counter: &'a Arc<AtomicU32>,
    pub settings: &'a SimulationSettings,
    pub cancel: &'a CancelToken,
}

/// Simulations of one pass, sorted by name.
pub struct SimulationGroupResult {
    pub pass: u32,
    pub simulations: Vec<Simulation>,
    /// Sandbox names handed out for this pass, keyed by simulation name.
    pub sandboxes: BTreeMap<String, String>,
    /// Set when the base view had no pending workloads.
    pub nothing_pending: bool,
}

impl SimulationGroupResult {
    pub fn successful(&self) -> impl Iterator<Item = &Simulation> {
        self.simulations
            .iter()
            .filter(|s| s.status() == SimulationStatus::Success)
    }

    pub fn view_of(&self, name: &str) -> Option<Arc<View>> {
        self.simulations
            .iter()
            .find(|s| s.name() == name)
            .map(|s| Arc::clone(s.view()))
    }

    /// True if the named simulation placed work on its synthetic node.
    pub fn used_scaled_node(&self, name: &str) -> bool {
        self.simulations
            .iter()
            .find(|s| s.name() == name)
            .and_then(Simulation::result)
            .is_some_and(|r| !r.scaled_assignment.workloads.is_empty())
    }

    /// Release every sandbox of the pass, keeping `keep` open.
    pub fn release_views(&self, views: &ViewAccess, keep: Option<&str>) {
        for (sim, sandbox) in &self.sandboxes {
            views.release(sandbox, keep == Some(sim.as_str()));
        }
    }
}

/// Scores of one pass and the selected winner.
#[derive(Debug, Clone, Default)]
pub struct SimulationGroupScores {
    pub scores: Vec<NodeScore>,
    pub winner: Option<NodeScore>,
}

impl SimulationGroup {
    /// Run one pass of every eligible candidate against `base`.
    pub async fn run_pass(
        &self,
        env: &PassEnv<'_>,
        base: &Arc<View>,
        eligible: impl Fn(&NodePool) -> bool,
    ) -> SimResult<SimulationGroupResult> {
        let pass = env.pass_counter.load(Ordering::SeqCst);
        let mut result = SimulationGroupResult {
            pass,
            simulations: Vec::new(),
            sandboxes: BTreeMap::new(),
            nothing_pending: false,
        };

        let mut created = Vec::new();
        for candidate in &self.candidates {
            if !eligible(&candidate.node_pool) {
                debug!(candidate = %candidate.name(), "node pool quota reached, skipping");
                continue;
            }
            let name = candidate.name();
            let sandbox_name = format!("{name}@p{pass}");
            let view = env.views.sandbox_view_over(&sandbox_name, base);
            result.sandboxes.insert(name.clone(), sandbox_name.clone());

            let args = SimulationArgs {
                node_pool: Arc::clone(&candidate.node_pool),
                template_name: candidate.template_name.clone(),
                zone: candidate.zone.clone(),
                pass_counter: Arc::clone(env.pass_counter),
                launcher: Arc::clone(env.launcher),
                view,
                poll_interval: env.settings.poll_interval,
                timeout: env.settings.simulation_timeout,
                resync_interval: env.settings.resync_interval,
            };
            match Simulation::new(args) {
                Ok(sim) => created.push(sim),
                Err(e) if e.is_no_unscheduled_workloads() => {
                    debug!(candidate = %name, "no pending workloads in base view");
                    result.release_views(env.views, None);
                    result.nothing_pending = true;
                    return Ok(result);
                }
                Err(e) => {
                    warn!(candidate = %name, error = %e, "dropping candidate");
                    env.views.release(&sandbox_name, false);
                    result.sandboxes.remove(&name);
                }
            }
        }

        let mut tasks = JoinSet::new();
        for mut sim in created {
            let cancel = env.cancel.clone();
            tasks.spawn(
                async move {
                    sim.run(&cancel).await;
                    sim
                }
                .with_current_subscriber(),
            );
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(sim)) => result.simulations.push(sim),
                    Some(Err(e)) => warn!(pass, error = %e, "simulation task failed"),
                    None => break,
                },
                cause = env.cancel.cancelled() => {
                    // Simulations see the same token and stop their schedulers
                    // on the way out; abort only the ones that overrun.
                    let drained = tokio::time::timeout(CANCEL_GRACE, async {
                        while tasks.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!(pass, remaining = tasks.len(), "simulations overran cancellation, aborting");
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                    }
                    result.release_views(env.views, None);
                    return Err(SimulationError::Cancelled(cause));
                }
            }
        }

        // Simulations may all have observed the cancellation before we did.
        if let Some(cause) = env.cancel.cause() {
            result.release_views(env.views, None);
            return Err(SimulationError::Cancelled(cause));
        }

        result.simulations.sort_by(|a, b| a.name().cmp(b.name()));
        debug!(
            pass,
            priority = self.priority,
            simulations = result.simulations.len(),
            successful = result.successful().count(),
            "pass finished"
        );
        Ok(result)
    }

    /// Score every successful simulation that bound at least one workload or
    /// left nothing pending, then select the winner. A candidate that cannot
    /// be scored is dropped.
    pub fn score(
        &self,
        result: &SimulationGroupResult,
        scorer: &dyn NodeScorer,
        selector: &dyn NodeScoreSelector,
        rng: &mut StdRng,
    ) -> SimResult<SimulationGroupScores> {
        let mut scores = Vec::new();
        for sim in result.successful() {
            let Some(outcome) = sim.result() else {
                continue;
            };
            if !outcome.converged() && outcome.bound_workloads() == 0 {
                debug!(simulation = %outcome.name, "nothing bound during the run, not scored");
                continue;
            }
            let args = ScoringArgs {
                name: &outcome.name,
                placement: &outcome.placement,
                scaled_node: &outcome.scaled_node,
                scaled_assignment: &outcome.scaled_assignment,
                other_assignments: &outcome.other_assignments,
                unscheduled: &outcome.unscheduled,
            };
            match scorer.compute(&args) {
                Ok(score) => scores.push(score),
                Err(e) => {
                    let err = SimulationError::ComputeNodeScore {
                        name: outcome.name.clone(),
                        source: e,
                    };
                    warn!(error = %err, "dropping candidate");
                }
            }
        }

        let winner = if scores.is_empty() {
            None
        } else {
            Some(
                selector
                    .select(&scores, rng)
                    .map_err(SimulationError::SelectNodeScore)?,
            )
        };
        if let Some(w) = &winner {
            debug!(pass = result.pass, winner = %w.name, value = w.value, "pass winner selected");
        }
        Ok(SimulationGroupScores { scores, winner })
    }
}
