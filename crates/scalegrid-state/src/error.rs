//! Error types for cluster views.

use thiserror::Error;

use crate::types::ResourceKind;

/// Result type alias for view operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or writing a view.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{kind} {key} already exists in view {view}")]
    AlreadyExists {
        view: String,
        kind: ResourceKind,
        key: String,
    },

    #[error("{kind} {key} not found in view {view}")]
    NotFound {
        view: String,
        kind: ResourceKind,
        key: String,
    },

    #[error("workload {workload} is already bound to node {node}")]
    AlreadyBound { workload: String, node: String },

    #[error("view is closed: {0}")]
    Closed(String),
}
