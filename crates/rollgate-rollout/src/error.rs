//! Rollout error types.

use thiserror::Error;

/// Errors raised while compiling plans or reconciling runs.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("target {target} unreachable: {reason}")]
    TargetUnreachable { target: String, reason: String },

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("no accessor registered for target type {0}")]
    UnknownTargetType(String),

    #[error("failure tolerance exceeded: {0}")]
    ToleranceExceeded(String),

    #[error("gave up after {attempts} conflicting writes to {key}")]
    Conflict { key: String, attempts: u32 },

    #[error("state store error: {0}")]
    State(#[from] rollgate_state::StateError),
}

impl RolloutError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RolloutError::InvalidPlan(msg.into())
    }

    /// Short CamelCase reason recorded on conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            RolloutError::InvalidPlan(_) => "InvalidPlan",
            RolloutError::StrategyNotFound(_) => "StrategyNotFound",
            RolloutError::TargetUnreachable { .. } => "TargetUnreachable",
            RolloutError::TargetNotFound(_) => "TargetNotFound",
            RolloutError::UnknownTargetType(_) => "UnknownTargetType",
            RolloutError::ToleranceExceeded(_) => "ToleranceExceeded",
            RolloutError::Conflict { .. } => "Conflict",
            RolloutError::State(_) => "StateError",
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
