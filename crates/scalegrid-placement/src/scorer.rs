//! Node scoring for simulation outcomes.
//!
//! Each successful simulation leaves behind one scaled node and the
//! workloads the scheduler placed during the run. A scorer condenses that
//! into a single value:
//!
//! - **Least cost**: normalized units of placed work per unit of hourly
//!   price, `round(units * 100 / price)`. Higher is better.
//! - **Least waste**: normalized units of allocatable capacity left unused,
//!   `round(units(allocatable - placed) * 100)`. Lower is better. Work that
//!   also lands on pre-existing nodes drives the value negative, which
//!   rewards candidates that unlock existing capacity.

use std::cmp::Ordering;
use std::sync::Arc;

use scalegrid_state::{
    Node, NodeAssignment, NodePlacement, ResourceList, ScoringStrategy, WorkloadKey,
};

use crate::error::{ScoreError, ScoreResult};
use crate::pricing::{InstancePricingAccess, ResourceWeights, normalized_units};

/// Everything a scorer needs to know about one simulation outcome.
#[derive(Debug, Clone, Copy)]
pub struct ScoringArgs<'a> {
    pub name: &'a str,
    pub placement: &'a NodePlacement,
    pub scaled_node: &'a Node,
    pub scaled_assignment: &'a NodeAssignment,
    pub other_assignments: &'a [NodeAssignment],
    pub unscheduled: &'a [WorkloadKey],
}

impl ScoringArgs<'_> {
    /// Requests of every workload placed during the run, on any node.
    pub fn aggregated_requests(&self) -> ResourceList {
        let mut total = self.scaled_assignment.total_requests();
        for other in self.other_assignments {
            total.add(&other.total_requests());
        }
        total
    }
}

/// Scored outcome of one simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub name: String,
    pub placement: NodePlacement,
    pub value: i64,
    /// Allocatable resources of the scaled node.
    pub scaled_node_resources: ResourceList,
    /// Workloads still pending after the run.
    pub unscheduled: Vec<WorkloadKey>,
    pub hourly_price: f64,
    pub normalized_allocatable: f64,
}

/// Whether higher or lower score values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorePreference {
    HigherIsBetter,
    LowerIsBetter,
}

impl ScorePreference {
    /// `Greater` if `a` is preferred over `b`.
    pub fn compare(self, a: i64, b: i64) -> Ordering {
        match self {
            ScorePreference::HigherIsBetter => a.cmp(&b),
            ScorePreference::LowerIsBetter => b.cmp(&a),
        }
    }
}

/// Computes a [`NodeScore`] from one simulation outcome.
pub trait NodeScorer: Send + Sync {
    fn compute(&self, args: &ScoringArgs<'_>) -> ScoreResult<NodeScore>;

    fn preference(&self) -> ScorePreference;
}

/// Build the scorer for a strategy.
pub fn scorer_for(
    strategy: ScoringStrategy,
    pricing: Arc<dyn InstancePricingAccess>,
    weights: Arc<dyn ResourceWeights>,
) -> Box<dyn NodeScorer> {
    match strategy {
        ScoringStrategy::LeastCost => Box::new(LeastCostScorer { pricing, weights }),
        ScoringStrategy::LeastWaste => Box::new(LeastWasteScorer { pricing, weights }),
    }
}

pub struct LeastCostScorer {
    pricing: Arc<dyn InstancePricingAccess>,
    weights: Arc<dyn ResourceWeights>,
}

impl LeastCostScorer {
    pub fn new(pricing: Arc<dyn InstancePricingAccess>, weights: Arc<dyn ResourceWeights>) -> Self {
        Self { pricing, weights }
    }
}

impl NodeScorer for LeastCostScorer {
    fn compute(&self, args: &ScoringArgs<'_>) -> ScoreResult<NodeScore> {
        let mut score = base_score(args, self.pricing.as_ref(), self.weights.as_ref())?;
        let weights = self.weights.weights(&args.placement.instance_type);
        let units = normalized_units(&args.aggregated_requests(), weights);
        score.value = (units * 100.0 / score.hourly_price).round() as i64;
        Ok(score)
    }

    fn preference(&self) -> ScorePreference {
        ScorePreference::HigherIsBetter
    }
}

pub struct LeastWasteScorer {
    pricing: Arc<dyn InstancePricingAccess>,
    weights: Arc<dyn ResourceWeights>,
}

impl LeastWasteScorer {
    pub fn new(pricing: Arc<dyn InstancePricingAccess>, weights: Arc<dyn ResourceWeights>) -> Self {
        Self { pricing, weights }
    }
}

impl NodeScorer for LeastWasteScorer {
    fn compute(&self, args: &ScoringArgs<'_>) -> ScoreResult<NodeScore> {
        let mut score = base_score(args, self.pricing.as_ref(), self.weights.as_ref())?;
        let weights = self.weights.weights(&args.placement.instance_type);
        let waste = args
            .scaled_node
            .allocatable
            .signed_sub(&args.aggregated_requests());
        score.value = (normalized_units(&waste, weights) * 100.0).round() as i64;
        Ok(score)
    }

    fn preference(&self) -> ScorePreference {
        ScorePreference::LowerIsBetter
    }
}

/// Fields shared by every strategy; `value` is filled in by the caller.
fn base_score(
    args: &ScoringArgs<'_>,
    pricing: &dyn InstancePricingAccess,
    weights: &dyn ResourceWeights,
) -> ScoreResult<NodeScore> {
    let placement = args.placement;
    let hourly_price = pricing
        .hourly_price(&placement.region, &placement.instance_type)
        .map_err(|e| ScoreError::ComputeNodeScore {
            name: args.name.to_string(),
            reason: e.to_string(),
        })?;
    let allocatable = args.scaled_node.allocatable.clone();
    let normalized_allocatable =
        normalized_units(&allocatable, weights.weights(&placement.instance_type));
    Ok(NodeScore {
        name: args.name.to_string(),
        placement: placement.clone(),
        value: 0,
        scaled_node_resources: allocatable,
        unscheduled: args.unscheduled.to_vec(),
        hourly_price,
        normalized_allocatable,
    })
}
