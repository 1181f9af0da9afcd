//! One simulation: a single candidate node tried in an isolated view.
//!
//! A simulation injects a synthetic node built from a node template into
//! its own sandbox view, launches a scheduler against that view and
//! watches the view's event sink until every pending workload is placed
//! or the scheduler has given up on the rest. Hitting the simulation
//! deadline or outer cancellation fails the run; siblings are unaffected by
//! a deadline.
//!
//! Lifecycle: `Pending -> Running -> {Success | Failure}`, no retries.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use scalegrid_scheduler::{CancelToken, LaunchParams, SchedulerLauncher};
use scalegrid_state::{
    AssignedWorkload, ClusterObject, EventReason, Node, NodeAssignment, NodePlacement, NodePool,
    NodeTemplate, View, WorkloadKey, labels,
};

use crate::error::{SimResult, SimulationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationStatus::Pending => f.write_str("pending"),
            SimulationStatus::Running => f.write_str("running"),
            SimulationStatus::Success => f.write_str("success"),
            SimulationStatus::Failure => f.write_str("failure"),
        }
    }
}

pub struct SimulationArgs {
    pub node_pool: Arc<NodePool>,
    pub template_name: String,
    pub zone: String,
    /// Shared with the simulator; names the synthetic node.
    pub pass_counter: Arc<AtomicU32>,
    pub launcher: Arc<SchedulerLauncher>,
    /// Sandbox owned by this simulation alone.
    pub view: Arc<View>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub resync_interval: Duration,
}

/// What a successful simulation leaves behind.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub name: String,
    pub placement: NodePlacement,
    pub scaled_node: Node,
    /// Workloads bound to the synthetic node.
    pub scaled_assignment: NodeAssignment,
    /// Workloads bound to pre-existing nodes, one entry per node.
    pub other_assignments: Vec<NodeAssignment>,
    /// Workloads still pending at the end of the run, sorted.
    pub unscheduled: Vec<WorkloadKey>,
    pub view: Arc<View>,
}

impl SimulationResult {
    /// Nothing was left pending at the end of the run.
    pub fn converged(&self) -> bool {
        self.unscheduled.is_empty()
    }

    /// Workloads bound during the run, on any node.
    pub fn bound_workloads(&self) -> usize {
        self.scaled_assignment.workloads.len()
            + self
                .other_assignments
                .iter()
                .map(|a| a.workloads.len())
                .sum::<usize>()
    }
}

pub struct Simulation {
    name: String,
    args: SimulationArgs,
    template: NodeTemplate,
    status: SimulationStatus,
    unscheduled: BTreeSet<WorkloadKey>,
    scheduled: BTreeMap<WorkloadKey, String>,
    result: Option<SimulationResult>,
    error: Option<SimulationError>,
}

impl Simulation {
    /// Fails if the template is not part of the pool or if the view has
    /// nothing pending.
    pub fn new(args: SimulationArgs) -> SimResult<Self> {
        let name = format!(
            "{}/{}/{}",
            args.node_pool.name, args.template_name, args.zone
        );
        let create_error = |source: SimulationError| SimulationError::CreateSimulation {
            name: name.clone(),
            source: Box::new(source),
        };

        let template = args
            .node_pool
            .template(&args.template_name)
            .cloned()
            .ok_or_else(|| {
                create_error(SimulationError::TemplateNotFound {
                    pool: args.node_pool.name.clone(),
                    template: args.template_name.clone(),
                })
            })?;
        let unscheduled: BTreeSet<WorkloadKey> = args
            .view
            .unscheduled_workloads()
            .map_err(|e| create_error(e.into()))?
            .iter()
            .map(|w| w.key())
            .collect();
        if unscheduled.is_empty() {
            return Err(create_error(SimulationError::NoUnscheduledWorkloads));
        }

        Ok(Self {
            name,
            args,
            template,
            status: SimulationStatus::Pending,
            unscheduled,
            scheduled: BTreeMap::new(),
            result: None,
            error: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SimulationStatus {
        self.status
    }

    pub fn view(&self) -> &Arc<View> {
        &self.args.view
    }

    pub fn result(&self) -> Option<&SimulationResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&SimulationError> {
        self.error.as_ref()
    }

    pub fn placement(&self) -> NodePlacement {
        NodePlacement {
            node_pool: self.args.node_pool.name.clone(),
            node_template: self.template.name.clone(),
            instance_type: self.template.instance_type.clone(),
            region: self.args.node_pool.region.clone(),
            zone: self.args.zone.clone(),
        }
    }

    /// Run the simulation to completion and return the final status. On
    /// failure the error is kept on the simulation.
    pub async fn run(&mut self, cancel: &CancelToken) -> SimulationStatus {
        if self.status != SimulationStatus::Pending {
            warn!(simulation = %self.name, status = %self.status, "simulation already ran");
            return self.status;
        }
        self.status = SimulationStatus::Running;
        match self.execute(cancel).await {
            Ok(result) => {
                info!(
                    simulation = %self.name,
                    scaled = result.scaled_assignment.workloads.len(),
                    leftover = result.unscheduled.len(),
                    "simulation finished"
                );
                self.result = Some(result);
                self.status = SimulationStatus::Success;
            }
            Err(e) => {
                warn!(simulation = %self.name, error = %e, "simulation failed");
                self.error = Some(SimulationError::RunSimulation {
                    name: self.name.clone(),
                    source: Box::new(e),
                });
                self.status = SimulationStatus::Failure;
            }
        }
        self.status
    }

    async fn execute(&mut self, cancel: &CancelToken) -> SimResult<SimulationResult> {
        let pass = self.args.pass_counter.load(Ordering::SeqCst);
        let node = self.synthetic_node(pass);
        self.args
            .view
            .create_object(ClusterObject::Node(node.clone()))?;
        debug!(simulation = %self.name, node = %node.name, "synthetic node injected");

        let timeout_cause = SimulationError::SimulationTimeout(self.name.clone()).to_string();
        let run_ctx = cancel.child_with_timeout(self.args.timeout, timeout_cause);

        let launched = self
            .args
            .launcher
            .launch(
                &run_ctx,
                LaunchParams {
                    name: self.name.clone(),
                    view: Arc::clone(&self.args.view),
                    resync_interval: self.args.resync_interval,
                },
            )
            .await;
        let handle = match launched {
            Ok(handle) => handle,
            Err(_) if cancel.is_cancelled() => {
                return Err(SimulationError::Cancelled(
                    cancel.cause().unwrap_or_default(),
                ));
            }
            Err(e) => return Err(SimulationError::LaunchScheduler(e)),
        };

        let watched = self.watch_events(cancel, &run_ctx).await;
        if let Err(e) = handle.stop().await {
            warn!(simulation = %self.name, error = %e, "scheduler did not stop cleanly");
        }
        watched?;

        self.build_result(node)
    }

    /// Poll the view's event sink until the run is over.
    async fn watch_events(&mut self, cancel: &CancelToken, run_ctx: &CancelToken) -> SimResult<()> {
        let mut ticker = tokio::time::interval(self.args.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cursor = 0usize;
        let mut given_up: HashSet<WorkloadKey> = HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = run_ctx.cancelled() => {}
            }

            let events = self.args.view.events_since(cursor)?;
            cursor += events.len();
            for event in events {
                match event.reason {
                    EventReason::Scheduled => {
                        if let Some(node) = event.node_name {
                            self.record_scheduled(event.workload, node);
                        }
                    }
                    EventReason::FailedScheduling => {
                        given_up.insert(event.workload);
                    }
                }
            }

            if self.unscheduled.is_empty() {
                return Ok(());
            }
            if let Some(cause) = cancel.cause() {
                return Err(SimulationError::Cancelled(cause));
            }
            if run_ctx.deadline_expired() {
                debug!(
                    simulation = %self.name,
                    leftover = self.unscheduled.len(),
                    "simulation deadline reached"
                );
                return Err(SimulationError::SimulationTimeout(self.name.clone()));
            }
            if self.unscheduled.iter().all(|k| given_up.contains(k)) {
                debug!(
                    simulation = %self.name,
                    leftover = self.unscheduled.len(),
                    "scheduler gave up on remaining workloads"
                );
                return Ok(());
            }
        }
    }

    fn record_scheduled(&mut self, workload: WorkloadKey, node: String) {
        if self.scheduled.contains_key(&workload) {
            return;
        }
        self.unscheduled.remove(&workload);
        self.scheduled.insert(workload, node);
    }

    fn build_result(&self, node: Node) -> SimResult<SimulationResult> {
        let view = &self.args.view;
        let runtime_classes = view.runtime_classes()?;

        let mut by_node: BTreeMap<&str, Vec<AssignedWorkload>> = BTreeMap::new();
        for (key, node_name) in &self.scheduled {
            let requests = view
                .get_workload(key)?
                .map(|w| w.effective_requests(&runtime_classes))
                .unwrap_or_default();
            by_node
                .entry(node_name.as_str())
                .or_default()
                .push(AssignedWorkload {
                    key: key.clone(),
                    requests,
                });
        }

        let scaled_assignment = NodeAssignment {
            node_name: node.name.clone(),
            workloads: by_node.remove(node.name.as_str()).unwrap_or_default(),
        };
        let other_assignments = by_node
            .into_iter()
            .map(|(node_name, workloads)| NodeAssignment {
                node_name: node_name.to_string(),
                workloads,
            })
            .collect();

        Ok(SimulationResult {
            name: self.name.clone(),
            placement: self.placement(),
            scaled_node: node,
            scaled_assignment,
            other_assignments,
            unscheduled: self.unscheduled.iter().cloned().collect(),
            view: Arc::clone(view),
        })
    }

    /// The node a scale-out of this candidate would add.
    fn synthetic_node(&self, pass: u32) -> Node {
        let pool = &self.args.node_pool;
        let template = &self.template;
        let name = format!(
            "sim-p{pass}-{}-{}-{}",
            self.args.zone, template.name, pool.name
        );

        let mut node_labels = pool.labels.clone();
        for (key, value) in [
            (labels::NODE_POOL, pool.name.as_str()),
            (labels::NODE_TEMPLATE, template.name.as_str()),
            (labels::INSTANCE_TYPE, template.instance_type.as_str()),
            (labels::ARCH, template.architecture.as_str()),
            (labels::REGION, pool.region.as_str()),
            (labels::ZONE, self.args.zone.as_str()),
            (labels::HOSTNAME, name.as_str()),
            (labels::SIMULATED, "true"),
        ] {
            node_labels.insert(key.to_string(), value.to_string());
        }

        let mut taints = pool.taints.clone();
        for taint in &template.taints {
            if !taints.contains(taint) {
                taints.push(taint.clone());
            }
        }

        Node {
            name,
            labels: node_labels,
            taints,
            capacity: template.capacity.clone(),
            allocatable: template.allocatable(),
            unschedulable: false,
        }
    }
}
