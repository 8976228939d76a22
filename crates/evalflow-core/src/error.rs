use thiserror::Error;

use crate::scorer::ScorerSignature;

/// Configuration and validation failures. These are raised before any case executes.
///
/// Task and scorer failures are not represented here: they are isolated per case
/// and end up as strings in `EvaluationResult::errors`.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("parallelism must be between 1 and {max}, got {value}")]
    InvalidParallelism { value: usize, max: usize },

    #[error("invalid case at index {index}: {reason}")]
    InvalidCase { index: usize, reason: String },

    #[error("scorer '{scorer}' has an unsupported signature ({signature}); expected 3, 4 or 5 parameters")]
    UnsupportedScorerArity {
        scorer: String,
        signature: ScorerSignature,
    },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("failed to load cases: {0:#}")]
    DataSource(#[source] anyhow::Error),

    #[error("worker pool failed: {0:#}")]
    Pool(#[source] anyhow::Error),
}
