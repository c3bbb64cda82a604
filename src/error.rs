//! Error types for the ensemble-forecast library.

use thiserror::Error;

/// Result type alias for ensemble-forecast operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Errors that can occur while building, training or aggregating ensembles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnsembleError {
    /// A distribution head produced output violating its structural contract
    /// (non-finite location/scale, non-finite quantile increment).
    #[error("head contract violation for member {member}: {detail}")]
    HeadContractViolation { member: usize, detail: String },

    /// A member's training loss became non-finite. Recorded per member,
    /// never retried automatically.
    #[error("training diverged for member {member} at epoch {epoch}")]
    TrainingDivergence { member: usize, epoch: usize },

    /// The ensemble handed to the aggregation engine cannot be aggregated
    /// (too few valid members under fail-fast, mismatched quantile grids).
    #[error("aggregation input error: {0}")]
    AggregationInputError(String),

    /// Invalid strategy, method or hyperparameter configuration. Fails at
    /// call time, never silently defaulted.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The engine must be fitted before generating or aggregating.
    #[error("engine must be fitted before use")]
    FitRequired,

    /// Dimension mismatch between data structures.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Input data is empty.
    #[error("empty input data")]
    EmptyData,

    /// Numerical failure outside the per-member taxonomy (singular basis,
    /// non-converging inversion).
    #[error("computation error: {0}")]
    ComputationError(String),
}

impl EnsembleError {
    /// Re-attribute a per-member error to the given member index.
    ///
    /// Heads raise contract violations without knowing which member invoked
    /// them; the strategy engine attaches the index on the way up.
    pub fn for_member(self, index: usize) -> Self {
        match self {
            EnsembleError::HeadContractViolation { detail, .. } => {
                EnsembleError::HeadContractViolation {
                    member: index,
                    detail,
                }
            }
            EnsembleError::TrainingDivergence { epoch, .. } => {
                EnsembleError::TrainingDivergence {
                    member: index,
                    epoch,
                }
            }
            other => other,
        }
    }
}
