//! Scheduling algorithms run by a scheduler loop.
//!
//! One cycle lists the view, then walks the pending workloads in priority
//! order and binds each to the best fitting node. Workloads that fit
//! nowhere get a single `FailedScheduling` event per scheduler instance.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use scalegrid_state::{CPU, ClientFacade, MEMORY, Node, ResourceList, WorkloadKey};

use crate::error::SchedulerResult;

/// State carried between cycles of one scheduler instance.
#[derive(Debug, Default)]
pub struct CycleState {
    pub reported_unschedulable: HashSet<WorkloadKey>,
    pub cycles: u64,
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub bound: usize,
    pub unschedulable: usize,
}

/// A scheduling algorithm driven by the scheduler loop.
pub trait SchedulingAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    fn run_cycle(
        &self,
        client: &ClientFacade,
        state: &mut CycleState,
    ) -> SchedulerResult<CycleOutcome>;
}

/// Most-allocated bin-packing.
///
/// Filters nodes on schedulability, node selector, taints and free
/// resources (runtime overhead included), then prefers the node that ends
/// up fullest. Ties go to the lexicographically smallest node name.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinPackScheduler;

impl SchedulingAlgorithm for BinPackScheduler {
    fn name(&self) -> &str {
        "bin-pack"
    }

    fn run_cycle(
        &self,
        client: &ClientFacade,
        state: &mut CycleState,
    ) -> SchedulerResult<CycleOutcome> {
        state.cycles += 1;
        let nodes = client.list_nodes()?;
        let workloads = client.list_workloads()?;
        let priority_classes = client.priority_classes()?;
        let runtime_classes = client.runtime_classes()?;

        let mut used: HashMap<String, ResourceList> = HashMap::new();
        for w in workloads.iter().filter(|w| !w.is_unscheduled()) {
            if let Some(node) = w.node_name.as_deref() {
                used.entry(node.to_string())
                    .or_default()
                    .add(&w.effective_requests(&runtime_classes));
            }
        }

        let mut pending: Vec<_> = workloads.iter().filter(|w| w.is_unscheduled()).collect();
        pending.sort_by_key(|w| (Reverse(w.effective_priority(&priority_classes)), w.key()));

        let mut outcome = CycleOutcome::default();
        for workload in pending {
            let key = workload.key();
            let requests = workload.effective_requests(&runtime_classes);

            let best = nodes
                .iter()
                .filter(|n| !n.unschedulable && workload.selects(n))
                .filter(|n| workload.tolerates_all(&n.taints))
                .filter_map(|n| {
                    let in_use = used.get(&n.name).cloned().unwrap_or_default();
                    let free = n.allocatable.saturating_sub(&in_use);
                    if !free.covers(&requests) {
                        return None;
                    }
                    let mut after = in_use;
                    after.add(&requests);
                    Some((utilization(n, &after), n))
                })
                .max_by(|(ua, na), (ub, nb)| ua.total_cmp(ub).then_with(|| nb.name.cmp(&na.name)));

            match best {
                Some((score, node)) => {
                    client.bind(&key, &node.name)?;
                    used.entry(node.name.clone()).or_default().add(&requests);
                    state.reported_unschedulable.remove(&key);
                    outcome.bound += 1;
                    trace!(workload = %key, node = %node.name, score, "workload bound");
                }
                None => {
                    outcome.unschedulable += 1;
                    if state.reported_unschedulable.insert(key.clone()) {
                        let message = format!(
                            "0/{} nodes are available for {key}",
                            nodes.len()
                        );
                        client.report_unschedulable(&key, &message)?;
                    }
                }
            }
        }

        if outcome.bound > 0 {
            debug!(
                view = client.view_name(),
                cycle = state.cycles,
                bound = outcome.bound,
                unschedulable = outcome.unschedulable,
                "scheduling cycle finished"
            );
        }
        Ok(outcome)
    }
}

/// Mean utilization of cpu and memory after placement, in `[0, 1]`.
fn utilization(node: &Node, used: &ResourceList) -> f64 {
    let ratios: Vec<f64> = [CPU, MEMORY]
        .into_iter()
        .filter(|r| node.allocatable.get(r) > 0)
        .map(|r| used.get(r) as f64 / node.allocatable.get(r) as f64)
        .collect();
    if ratios.is_empty() {
        return 0.0;
    }
    ratios.iter().sum::<f64>() / ratios.len() as f64
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use scalegrid_state::{
        ClusterSnapshot, EventReason, PriorityClass, RuntimeClass, Taint, TaintEffect, View,
        Workload,
    };

    fn make_node(name: &str, cores: i64, gib: i64) -> Node {
        Node {
            name: name.to_string(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            capacity: ResourceList::cpu_mem(cores, gib),
            allocatable: ResourceList::cpu_mem(cores, gib),
            unschedulable: false,
        }
    }

    fn make_view(snapshot: ClusterSnapshot) -> Arc<View> {
        let base = View::new_base("base");
        base.load_snapshot(&snapshot).unwrap();
        View::sandbox("sandbox", &base)
    }

    fn bound_node(view: &View, name: &str) -> Option<String> {
        view.get_workload(&WorkloadKey::new("default", name))
            .unwrap()
            .and_then(|w| w.node_name)
    }

    #[test]
    fn packs_onto_the_fullest_fitting_node() {
        let mut partly_used = Workload::pending("default", "existing", ResourceList::cpu_mem(2, 2));
        partly_used.node_name = Some("busy".to_string());
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("idle", 4, 8), make_node("busy", 4, 8)],
            workloads: vec![
                partly_used,
                Workload::pending("default", "w1", ResourceList::cpu_mem(1, 1)),
            ],
            ..Default::default()
        });

        let outcome = BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();
        assert_eq!(outcome.bound, 1);
        assert_eq!(bound_node(&view, "w1").as_deref(), Some("busy"));
    }

    #[test]
    fn respects_capacity() {
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("n1", 2, 4)],
            workloads: vec![
                Workload::pending("default", "a", ResourceList::cpu_mem(1, 1)),
                Workload::pending("default", "b", ResourceList::cpu_mem(1, 1)),
                Workload::pending("default", "c", ResourceList::cpu_mem(1, 1)),
            ],
            ..Default::default()
        });

        let outcome = BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();
        assert_eq!(outcome, CycleOutcome { bound: 2, unschedulable: 1 });
        assert_eq!(bound_node(&view, "c"), None);
    }

    #[test]
    fn higher_priority_is_placed_first() {
        let mut urgent = Workload::pending("default", "urgent", ResourceList::cpu_mem(2, 1));
        urgent.priority_class_name = Some("high".to_string());
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("n1", 2, 4)],
            workloads: vec![
                Workload::pending("default", "a-low", ResourceList::cpu_mem(2, 1)),
                urgent,
            ],
            priority_classes: vec![PriorityClass {
                name: "high".to_string(),
                value: 1000,
            }],
            ..Default::default()
        });

        BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();
        assert_eq!(bound_node(&view, "urgent").as_deref(), Some("n1"));
        assert_eq!(bound_node(&view, "a-low"), None);
    }

    #[test]
    fn respects_taints_and_selectors() {
        let mut tainted = make_node("gpu", 8, 16);
        tainted.taints.push(Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: TaintEffect::NoSchedule,
        });
        let mut labelled = make_node("arm", 8, 16);
        labelled
            .labels
            .insert("kubernetes.io/arch".to_string(), "arm64".to_string());

        let mut wants_arm = Workload::pending("default", "wants-arm", ResourceList::cpu_mem(1, 1));
        wants_arm
            .node_selector
            .insert("kubernetes.io/arch".to_string(), "arm64".to_string());
        let mut wants_amd = Workload::pending("default", "wants-amd", ResourceList::cpu_mem(1, 1));
        wants_amd
            .node_selector
            .insert("kubernetes.io/arch".to_string(), "amd64".to_string());

        let view = make_view(ClusterSnapshot {
            nodes: vec![tainted, labelled],
            workloads: vec![wants_arm, wants_amd],
            ..Default::default()
        });

        let outcome = BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();
        assert_eq!(outcome.bound, 1);
        assert_eq!(bound_node(&view, "wants-arm").as_deref(), Some("arm"));
        assert_eq!(bound_node(&view, "wants-amd"), None);
    }

    #[test]
    fn runtime_overhead_counts_against_capacity() {
        let mut sandboxed = Workload::pending("default", "sandboxed", ResourceList::cpu_mem(2, 1));
        sandboxed.runtime_class_name = Some("kata".to_string());
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("n1", 2, 4)],
            workloads: vec![sandboxed],
            runtime_classes: vec![RuntimeClass {
                name: "kata".to_string(),
                overhead: ResourceList::cpu_mem(1, 0),
            }],
            ..Default::default()
        });

        let outcome = BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();
        assert_eq!(outcome.unschedulable, 1);
    }

    #[test]
    fn reports_unschedulable_once() {
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("n1", 1, 1)],
            workloads: vec![Workload::pending("default", "big", ResourceList::cpu_mem(8, 8))],
            ..Default::default()
        });
        let client = view.client();
        let mut state = CycleState::default();

        BinPackScheduler.run_cycle(&client, &mut state).unwrap();
        BinPackScheduler.run_cycle(&client, &mut state).unwrap();

        let events = view.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EventReason::FailedScheduling);
        assert_eq!(state.cycles, 2);
    }

    #[test]
    fn binding_emits_scheduled_event() {
        let view = make_view(ClusterSnapshot {
            nodes: vec![make_node("n1", 4, 4)],
            workloads: vec![Workload::pending("default", "w", ResourceList::cpu_mem(1, 1))],
            ..Default::default()
        });
        BinPackScheduler
            .run_cycle(&view.client(), &mut CycleState::default())
            .unwrap();

        let events = view.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EventReason::Scheduled);
        assert_eq!(events[0].node_name.as_deref(), Some("n1"));
    }
}
