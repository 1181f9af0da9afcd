//! Cluster object types.
//!
//! These are the objects replayed into a [`View`](crate::view::View) from a
//! [`ClusterSnapshot`]: nodes, workloads, priority classes and runtime
//! classes. All types are serde-serializable so snapshots can be loaded
//! from JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceList;

/// Well-known node label keys.
pub mod labels {
    pub const NODE_POOL: &str = "scalegrid.io/node-pool";
    pub const NODE_TEMPLATE: &str = "scalegrid.io/node-template";
    pub const SIMULATED: &str = "scalegrid.io/simulated";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const ZONE: &str = "topology.kubernetes.io/zone";
    pub const REGION: &str = "topology.kubernetes.io/region";
    pub const ARCH: &str = "kubernetes.io/arch";
    pub const HOSTNAME: &str = "kubernetes.io/hostname";
}

// ── Object keys ────────────────────────────────────────────────────

/// Kind of object stored in a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Node,
    Workload,
    PriorityClass,
    RuntimeClass,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Node => "node",
            ResourceKind::Workload => "workload",
            ResourceKind::PriorityClass => "priority_class",
            ResourceKind::RuntimeClass => "runtime_class",
        };
        f.write_str(s)
    }
}

/// Namespaced name identifying a workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Taints ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` matches every effect.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
    /// Cordoned nodes accept no new workloads.
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

// ── Workload ───────────────────────────────────────────────────────

/// A deployable unit with resource requests and an optional node binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub requests: ResourceList,
    /// Name of the node this workload is bound to. `None` means pending.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Explicit priority; overrides `priority_class_name` when set.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub runtime_class_name: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

impl Workload {
    /// Build a pending workload with the given requests.
    pub fn pending(namespace: &str, name: &str, requests: ResourceList) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            requests,
            node_name: None,
            priority: None,
            priority_class_name: None,
            runtime_class_name: None,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
        }
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }

    pub fn is_unscheduled(&self) -> bool {
        self.node_name.as_deref().is_none_or(str::is_empty)
    }

    /// Priority from the explicit field, else its priority class, else 0.
    pub fn effective_priority(&self, classes: &[PriorityClass]) -> i32 {
        if let Some(p) = self.priority {
            return p;
        }
        self.priority_class_name
            .as_deref()
            .and_then(|name| classes.iter().find(|c| c.name == name))
            .map_or(0, |c| c.value)
    }

    /// Requests plus the overhead of the workload's runtime class, if any.
    pub fn effective_requests(&self, runtime_classes: &[RuntimeClass]) -> ResourceList {
        let mut requests = self.requests.clone();
        if let Some(rc) = self
            .runtime_class_name
            .as_deref()
            .and_then(|name| runtime_classes.iter().find(|c| c.name == name))
        {
            requests.add(&rc.overhead);
        }
        requests
    }

    /// True if every `NoSchedule`/`NoExecute` taint is tolerated.
    pub fn tolerates_all(&self, taints: &[Taint]) -> bool {
        taints
            .iter()
            .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
            .all(|t| self.tolerations.iter().any(|tol| tol.tolerates(t)))
    }

    /// True if every node selector entry matches the node's labels.
    pub fn selects(&self, node: &Node) -> bool {
        self.node_selector
            .iter()
            .all(|(k, v)| node.labels.get(k).is_some_and(|nv| nv == v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityClass {
    pub name: String,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeClass {
    pub name: String,
    #[serde(default)]
    pub overhead: ResourceList,
}

// ── Generic object ─────────────────────────────────────────────────

/// Any object a view can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterObject {
    Node(Node),
    Workload(Workload),
    PriorityClass(PriorityClass),
    RuntimeClass(RuntimeClass),
}

impl ClusterObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ClusterObject::Node(_) => ResourceKind::Node,
            ClusterObject::Workload(_) => ResourceKind::Workload,
            ClusterObject::PriorityClass(_) => ResourceKind::PriorityClass,
            ClusterObject::RuntimeClass(_) => ResourceKind::RuntimeClass,
        }
    }

    /// Key unique within the object's kind. Workloads use `namespace/name`.
    pub fn key(&self) -> String {
        match self {
            ClusterObject::Node(n) => n.name.clone(),
            ClusterObject::Workload(w) => w.key().to_string(),
            ClusterObject::PriorityClass(p) => p.name.clone(),
            ClusterObject::RuntimeClass(r) => r.name.clone(),
        }
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Baseline cluster state for one advice request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    #[serde(default)]
    pub priority_classes: Vec<PriorityClass>,
    #[serde(default)]
    pub runtime_classes: Vec<RuntimeClass>,
}

impl ClusterSnapshot {
    /// All snapshot objects in load order: classes first, then nodes, then workloads.
    pub fn objects(&self) -> impl Iterator<Item = ClusterObject> + '_ {
        self.priority_classes
            .iter()
            .cloned()
            .map(ClusterObject::PriorityClass)
            .chain(self.runtime_classes.iter().cloned().map(ClusterObject::RuntimeClass))
            .chain(self.nodes.iter().cloned().map(ClusterObject::Node))
            .chain(self.workloads.iter().cloned().map(ClusterObject::Workload))
    }

    pub fn unscheduled_workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.iter().filter(|w| w.is_unscheduled())
    }
}

/// Workloads bound to one node, with their effective requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub node_name: String,
    pub workloads: Vec<AssignedWorkload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedWorkload {
    pub key: WorkloadKey,
    pub requests: ResourceList,
}

impl NodeAssignment {
    pub fn total_requests(&self) -> ResourceList {
        ResourceList::sum(self.workloads.iter().map(|w| &w.requests))
    }
}
