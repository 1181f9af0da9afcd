//! Plan assembly and the result channel message.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_json::json;

use scalegrid_placement::NodeScore;
use scalegrid_state::{Node, NodePlacement, ScaleItem, ScaleOutPlan, WorkloadKey};

use crate::error::AdviceError;

/// Aggregate `winners` into per-placement deltas.
///
/// `current_replicas` counts the snapshot nodes that already carry the
/// placement's pool, template and zone labels.
pub fn build_plan(
    snapshot_nodes: &[Node],
    winners: &[NodeScore],
    leftover: &BTreeSet<WorkloadKey>,
) -> ScaleOutPlan {
    let mut deltas: BTreeMap<&NodePlacement, u32> = BTreeMap::new();
    for winner in winners {
        *deltas.entry(&winner.placement).or_default() += 1;
    }
    let items = deltas
        .into_iter()
        .map(|(placement, delta)| ScaleItem {
            placement: placement.clone(),
            current_replicas: snapshot_nodes
                .iter()
                .filter(|n| placement.matches(n))
                .count() as u32,
            delta,
        })
        .collect();
    ScaleOutPlan {
        items,
        unsatisfied_workload_names: leftover.iter().map(|k| k.to_string()).collect(),
    }
}

/// One message on the result channel.
///
/// Exactly one message per request has `terminal` set; it always carries
/// the cumulative plan or the error that ended the request.
#[derive(Debug)]
pub struct ScalingPlanResult {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub outcome: Result<ScaleOutPlan, AdviceError>,
    pub terminal: bool,
    pub trace_log_path: Option<PathBuf>,
}

impl ScalingPlanResult {
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "name": self.name,
            "labels": self.labels,
            "terminal": self.terminal,
        });
        match &self.outcome {
            Ok(plan) => value["plan"] = json!(plan),
            Err(e) => {
                value["error"] = json!({
                    "request_id": e.request_id,
                    "correlation_id": e.correlation_id,
                    "message": e.source.to_string(),
                })
            }
        }
        if let Some(path) = &self.trace_log_path {
            value["trace_log_path"] = json!(path.display().to_string());
        }
        value
    }
}
