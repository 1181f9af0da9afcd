//! Scaling constraints, advice requests and scale-out plans.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceList;
use crate::types::{ClusterSnapshot, Node, Taint, labels};

// ── Constraint ─────────────────────────────────────────────────────

/// A machine class that can be placed in one or more zones of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    pub instance_type: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    pub capacity: ResourceList,
    #[serde(default)]
    pub kube_reserved: ResourceList,
    #[serde(default)]
    pub system_reserved: ResourceList,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

fn default_architecture() -> String {
    "amd64".to_string()
}

impl NodeTemplate {
    /// Capacity minus kube and system reservations, floored at zero.
    pub fn allocatable(&self) -> ResourceList {
        self.capacity
            .saturating_sub(&self.kube_reserved)
            .saturating_sub(&self.system_reserved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub region: String,
    /// Pools are evaluated in ascending priority order, one group per value.
    #[serde(default)]
    pub priority: i32,
    pub zones: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub node_templates: Vec<NodeTemplate>,
    /// Upper bound on nodes of this pool (existing plus advised).
    #[serde(default)]
    pub max_nodes: Option<u32>,
}

impl NodePool {
    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.node_templates.iter().find(|t| t.name == name)
    }

    /// Number of nodes in `nodes` that belong to this pool.
    pub fn member_count(&self, nodes: &[Node]) -> usize {
        nodes
            .iter()
            .filter(|n| n.label(labels::NODE_POOL) == Some(self.name.as_str()))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingConstraint {
    pub node_pools: Vec<NodePool>,
}

// ── Request ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategy {
    #[default]
    LeastCost,
    LeastWaste,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStrategy {
    #[default]
    MultiSimulationsPerGroup,
    SingleSimulationPerGroup,
}

impl fmt::Display for SimulationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationStrategy::MultiSimulationsPerGroup => f.write_str("multi_simulations_per_group"),
            SimulationStrategy::SingleSimulationPerGroup => f.write_str("single_simulation_per_group"),
        }
    }
}

/// When scale-out plans are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceGenerationMode {
    /// One plan per simulation group that produced winners, then the final plan.
    Incremental,
    /// Only the final plan.
    #[default]
    AllAtOnce,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAdviceRequest {
    pub id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub constraint: ScalingConstraint,
    pub snapshot: ClusterSnapshot,
    #[serde(default)]
    pub scoring_strategy: ScoringStrategy,
    #[serde(default)]
    pub simulation_strategy: SimulationStrategy,
    #[serde(default)]
    pub advice_generation_mode: AdviceGenerationMode,
    /// 0 disables the per-request trace log.
    #[serde(default)]
    pub diagnostic_verbosity: u32,
}

// ── Plan ───────────────────────────────────────────────────────────

/// Where a scaled node lands: pool, template and zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePlacement {
    pub node_pool: String,
    pub node_template: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
}

impl NodePlacement {
    /// True if `node` carries this placement's pool, template and zone labels.
    pub fn matches(&self, node: &Node) -> bool {
        node.label(labels::NODE_POOL) == Some(self.node_pool.as_str())
            && node.label(labels::NODE_TEMPLATE) == Some(self.node_template.as_str())
            && node.label(labels::ZONE) == Some(self.zone.as_str())
    }
}

impl fmt::Display for NodePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node_pool, self.node_template, self.zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleItem {
    pub placement: NodePlacement,
    pub current_replicas: u32,
    pub delta: u32,
}

/// Final recommendation: per-placement node deltas plus unsatisfiable workloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOutPlan {
    pub items: Vec<ScaleItem>,
    pub unsatisfied_workload_names: Vec<String>,
}

impl ScaleOutPlan {
    pub fn total_delta(&self) -> u32 {
        self.items.iter().map(|i| i.delta).sum()
    }
}
