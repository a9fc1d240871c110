//! Error taxonomy for diff building, estimation and aggregation.

use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum SimulationError {
    /// Caller handed us lists that cannot be diffed (truncation bug, duplicate rows,
    /// malformed submission file).
    #[error("input shape error: {message}")]
    InputShape { message: String },

    /// A diff or estimate broke an internal invariant. The whole diff is rejected.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// No sampled universe came within the modeled variance of the observed delta.
    #[error(
        "no plausible universe after {rounds} rounds \
         (actual DCG delta {actual_dcg_delta:.4}, std dev {std_dev:.4})"
    )]
    DegenerateProbability {
        actual_dcg_delta: f64,
        std_dev: f64,
        rounds: usize,
    },

    #[error("diff has no changed rows to estimate")]
    EmptyDiff,

    #[error("pair {before} -> {after} failed: {source}")]
    PairFailed {
        before: String,
        after: String,
        #[source]
        source: Box<SimulationError>,
    },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker join error: {0}")]
    Join(String),
}

impl SimulationError {
    pub(crate) fn input_shape(message: impl Into<String>) -> Self {
        Self::InputShape {
            message: message.into(),
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    pub(crate) fn for_pair(self, before: Option<&str>, after: &str) -> Self {
        Self::PairFailed {
            before: before.unwrap_or("<empty>").to_string(),
            after: after.to_string(),
            source: Box::new(self),
        }
    }
}

pub type SimResult<T> = Result<T, SimulationError>;
