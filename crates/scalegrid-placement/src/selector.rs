//! Winner selection among the node scores of one pass.
//!
//! Selection narrows the candidates in three steps:
//!
//! 1. Keep the scores with the best value under the scorer's preference.
//! 2. Apply the selector criterion (largest normalized allocatable, or
//!    lowest hourly price).
//! 3. Break any remaining tie uniformly at random.

use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

use scalegrid_state::ScoringStrategy;

use crate::error::{ScoreError, ScoreResult};
use crate::scorer::{NodeScore, ScorePreference};

const EPSILON: f64 = 1e-9;

/// Picks one winner from a non-empty set of scores.
pub trait NodeScoreSelector: Send + Sync {
    fn select(&self, scores: &[NodeScore], rng: &mut StdRng) -> ScoreResult<NodeScore>;
}

/// Tie-break criterion applied after the best score value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStrategy {
    MaxAllocatable,
    MinPrice,
}

impl SelectorStrategy {
    /// Least-cost ties go to the cheapest node; least-waste ties to the largest.
    pub fn for_scoring(strategy: ScoringStrategy) -> Self {
        match strategy {
            ScoringStrategy::LeastCost => SelectorStrategy::MinPrice,
            ScoringStrategy::LeastWaste => SelectorStrategy::MaxAllocatable,
        }
    }
}

/// Build the selector for a scoring strategy.
pub fn selector_for(
    strategy: ScoringStrategy,
    preference: ScorePreference,
) -> Box<dyn NodeScoreSelector> {
    match SelectorStrategy::for_scoring(strategy) {
        SelectorStrategy::MaxAllocatable => Box::new(MaxAllocatableSelector::new(preference)),
        SelectorStrategy::MinPrice => Box::new(MinPriceSelector::new(preference)),
    }
}

/// Prefers the candidate whose node offers the most normalized capacity.
pub struct MaxAllocatableSelector {
    preference: ScorePreference,
}

impl MaxAllocatableSelector {
    pub fn new(preference: ScorePreference) -> Self {
        Self { preference }
    }
}

impl NodeScoreSelector for MaxAllocatableSelector {
    fn select(&self, scores: &[NodeScore], rng: &mut StdRng) -> ScoreResult<NodeScore> {
        select_with(scores, self.preference, rng, |s| s.normalized_allocatable)
    }
}

/// Prefers the candidate with the lowest hourly price.
pub struct MinPriceSelector {
    preference: ScorePreference,
}

impl MinPriceSelector {
    pub fn new(preference: ScorePreference) -> Self {
        Self { preference }
    }
}

impl NodeScoreSelector for MinPriceSelector {
    fn select(&self, scores: &[NodeScore], rng: &mut StdRng) -> ScoreResult<NodeScore> {
        select_with(scores, self.preference, rng, |s| -s.hourly_price)
    }
}

/// Shared selection; `criterion` is maximized.
fn select_with(
    scores: &[NodeScore],
    preference: ScorePreference,
    rng: &mut StdRng,
    criterion: impl Fn(&NodeScore) -> f64,
) -> ScoreResult<NodeScore> {
    match scores {
        [] => return Err(ScoreError::NoWinningNodeScore),
        [only] => return Ok(only.clone()),
        _ => {}
    }

    let best_value = scores
        .iter()
        .map(|s| s.value)
        .max_by(|a, b| preference.compare(*a, *b))
        .ok_or(ScoreError::NoWinningNodeScore)?;
    let best: Vec<&NodeScore> = scores.iter().filter(|s| s.value == best_value).collect();

    let top = best
        .iter()
        .map(|s| criterion(s))
        .fold(f64::NEG_INFINITY, f64::max);
    if !top.is_finite() {
        return Err(ScoreError::SelectNodeScore(format!(
            "non-finite selection criterion among {} candidates",
            best.len()
        )));
    }
    let tied: Vec<&NodeScore> = best
        .into_iter()
        .filter(|s| (criterion(s) - top).abs() <= EPSILON)
        .collect();

    let pick = rng.gen_range(0..tied.len());
    let winner = tied[pick];
    debug!(
        winner = %winner.name,
        value = winner.value,
        tied = tied.len(),
        "node score selected"
    );
    Ok(winner.clone())
}
