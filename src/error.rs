//! Error types for the signal pipeline
//!
//! Errors are classified by how the caller should react:
//! - Rejected: malformed or unclassifiable input, unknown entities
//! - Retryable: idempotent downstream reads that timed out or failed
//! - RequiresHuman: non-idempotent downstream calls that failed mid-flight
//!
//! Insufficient data is not an error. Statistical outputs that lack their
//! minimum observation count are withheld (`None`) instead.

use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;
use crate::entity::EntityRef;

/// Reasons an event or signal is rejected at ingestion. Nothing is written.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(EntityRef),

    #[error("Event {event_type} matched no registry entry")]
    Unclassifiable { event_type: String },

    #[error("Malformed signal weight: {0}")]
    MalformedWeight(String),

    #[error("Malformed signal polarity: {0}")]
    MalformedPolarity(String),

    #[error("Event references no entities")]
    NoEntities,

    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

/// Error types for the pipeline and its orchestration layer
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Context needs {needed} tokens but the declared budget is {budget}")]
    BudgetExceeded { needed: usize, budget: usize },

    #[error("Cost limit reached for {scope}/{tier} (hard={hard})")]
    CostLimitReached {
        scope: String,
        tier: String,
        hard: bool,
    },

    #[error("{capability} unavailable: {reason}")]
    DownstreamUnavailable {
        capability: String,
        reason: String,
        retryable: bool,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Returns true if the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::DownstreamUnavailable {
                retryable: true,
                ..
            }
        )
    }

    /// Returns true if the failure must surface to a human queue
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            PipelineError::DownstreamUnavailable {
                retryable: false,
                ..
            }
        )
    }

    /// Get a short recovery suggestion for operators
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "Fix the event payload or register the entity first.",
            PipelineError::BudgetExceeded { .. } => {
                "Narrow the target entities or request a larger tier."
            }
            PipelineError::CostLimitReached { hard: true, .. } => {
                "Wait for the next cost cycle or escalate to a human request."
            }
            PipelineError::CostLimitReached { .. } => "Usage is above the soft limit.",
            PipelineError::DownstreamUnavailable {
                retryable: true, ..
            } => "Retry with backoff.",
            PipelineError::DownstreamUnavailable { .. } => {
                "Review the pending item in the human queue."
            }
            PipelineError::Storage(_) => "Check database permissions and disk space.",
            PipelineError::Config(_) => "Check ~/.propintel/config.json.",
        }
    }
}

/// Serializable error representation for the orchestration caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineFailure {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Rejected,
    Retryable,
    RequiresHuman,
    Deferred,
    Internal,
}

impl From<&PipelineError> for PipelineFailure {
    fn from(err: &PipelineError) -> Self {
        let error_type = match err {
            PipelineError::Validation(_) | PipelineError::BudgetExceeded { .. } => {
                ErrorType::Rejected
            }
            PipelineError::CostLimitReached { .. } => ErrorType::Deferred,
            PipelineError::DownstreamUnavailable { .. } if err.is_retryable() => {
                ErrorType::Retryable
            }
            PipelineError::DownstreamUnavailable { .. } => ErrorType::RequiresHuman,
            PipelineError::Storage(_) | PipelineError::Config(_) => ErrorType::Internal,
        };

        PipelineFailure {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
