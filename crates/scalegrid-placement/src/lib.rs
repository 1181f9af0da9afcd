//! ScaleGrid node scoring: least-cost / least-waste scorers and winner selection.
//!
//! This crate turns the outcome of one simulation into a [`NodeScore`] and
//! picks a winner among the scores of one pass. It does not run
//! simulations (that's `scalegrid-sim`).
//!
//! # Components
//!
//! - **`pricing`**: Hourly instance prices and per-instance-type resource weights
//! - **`scorer`**: Node scorers (least-cost, least-waste)
//! - **`selector`**: Winner selection (max-allocatable, min-price)

pub mod error;
pub mod pricing;
pub mod scorer;
pub mod selector;

pub use error::{ScoreError, ScoreResult};
pub use pricing::{
    InstancePrice, InstancePricingAccess, ResourceWeightMap, ResourceWeights, StaticPricing,
    WeightTable, normalized_units,
};
pub use scorer::{
    LeastCostScorer, LeastWasteScorer, NodeScore, NodeScorer, ScorePreference, ScoringArgs,
    scorer_for,
};
pub use selector::{
    MaxAllocatableSelector, MinPriceSelector, NodeScoreSelector, SelectorStrategy, selector_for,
};
