//! Scoring error types.

use thiserror::Error;

/// Errors that can occur while scoring or selecting candidates.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("no hourly price for instance type {instance_type} in region {region}")]
    PriceNotFound {
        region: String,
        instance_type: String,
    },

    #[error("invalid hourly price {price} for instance type {instance_type}")]
    InvalidPrice { instance_type: String, price: f64 },

    #[error("invalid pricing data: {0}")]
    InvalidPricing(String),

    #[error("failed to compute node score for {name}: {reason}")]
    ComputeNodeScore { name: String, reason: String },

    #[error("failed to select node score: {0}")]
    SelectNodeScore(String),

    #[error("no winning node score")]
    NoWinningNodeScore,
}

pub type ScoreResult<T> = Result<T, ScoreError>;
