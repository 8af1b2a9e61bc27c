use std::fmt;

use thiserror::Error;

use crate::model::{JobStatus, Transition};

/// Error types for the Print Sentinel engine.
///
/// Every engine operation returns these synchronously. The engine never
/// retries on its own; mapping to user-facing responses is the caller's job.
pub type EngineResult<T> = Result<T, EngineError>;

/// Kind of entity referenced by a `NotFound` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Job,
    Printer,
    Spool,
    Alert,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Job => "job",
            Entity::Printer => "printer",
            Entity::Spool => "spool",
            Entity::Alert => "alert",
        };
        f.write_str(name)
    }
}

/// Main error type for engine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The requested job or printer state change is not permitted from the
    /// current state.
    #[error("transition '{transition}' not allowed from state '{status}'")]
    InvalidTransition {
        status: JobStatus,
        transition: Transition,
    },

    /// Progress must be finite, within 0..=100 and never go backwards.
    #[error("invalid progress {requested}% (current {current}%)")]
    InvalidProgress { current: f32, requested: f32 },

    /// Usage exceeded the remaining grams on a spool.
    ///
    /// Not returned by the ledger: usage is clamped and the shortfall is
    /// reported through [`crate::ledger::UsageOutcome`] and an alert.
    #[error("spool {spool} has {available:.1}g left, {requested:.1}g requested")]
    InsufficientMaterial {
        spool: String,
        requested: f32,
        available: f32,
    },

    /// A frame could not be analyzed. The analyzer reports this as a
    /// diagnostic on a zero-confidence result rather than returning it.
    #[error("frame analysis degraded: {0}")]
    AnalysisDegraded(String),

    /// Referenced job, printer, spool or alert does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: Entity, id: String },

    /// Malformed input value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request conflicts with existing state (duplicate id, spool busy).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether this error is the caller's fault (as opposed to storage).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Storage(_))
    }
}

/// Errors related to configuration loading and validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("required environment variable '{var_name}' is not set")]
    MissingEnvVar { var_name: String },

    /// Invalid configuration value provided.
    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_state_and_transition() {
        let err = EngineError::InvalidTransition {
            status: JobStatus::Queued,
            transition: Transition::AdvanceProgress,
        };
        assert_eq!(
            err.to_string(),
            "transition 'advance_progress' not allowed from state 'queued'"
        );
    }

    #[test]
    fn not_found_formats_entity() {
        let err = EngineError::not_found(Entity::Spool, "SPOOL_1");
        assert_eq!(err.to_string(), "spool 'SPOOL_1' not found");
        assert!(err.is_client_error());
        assert!(!EngineError::storage("poisoned").is_client_error());
    }
}
