//! # Pipeline Errors
//!
//! A single crate error plus the saga error it wraps. Every failure a stage sees
//! is classified once via [`PipelineError::category`], which decides the routing
//! of the invocation: transient failures are retried, validation failures are
//! reported and released, duplicates are treated as success.

use std::time::Duration;
use thiserror::Error;

/// How a failed invocation is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Remote or timing failure; the same input may succeed later.
    Transient,
    /// The input itself is bad; repeating the computation cannot help.
    Validation,
    /// The effect was already applied by an earlier delivery.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid decimal for {field}: {value:?}")]
    InvalidDecimal { field: String, value: String },

    #[error("Invalid {kind} value: {value:?}")]
    InvalidEnum { kind: &'static str, value: String },

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("Already applied: {key}")]
    Duplicate { key: String },

    #[error("Remote call to {service} failed: {message}")]
    Remote { service: String, message: String },

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stage {stage} is closed")]
    StageClosed { stage: String },

    #[error("Lease {key} is held by another process")]
    LeaseUnavailable { key: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Remote {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Duplicate { .. } => ErrorCategory::Duplicate,
            Self::Remote { .. }
            | Self::Timeout(_)
            | Self::StageClosed { .. }
            | Self::LeaseUnavailable { .. } => ErrorCategory::Transient,
            Self::Saga(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Saga(_)
            | Self::Validation(_)
            | Self::InvalidDecimal { .. }
            | Self::InvalidEnum { .. }
            | Self::InvalidTransition { .. }
            | Self::NotFound { .. }
            | Self::BusinessRule(_)
            | Self::Configuration(_) => ErrorCategory::Validation,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Text safe to show on the notification side channel.
    ///
    /// Internal details (service names, RPC payloads, raw remote messages) never
    /// appear here.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidDecimal { field, .. } => format!("invalid amount in {field}"),
            Self::InvalidEnum { kind, .. } => format!("unsupported {kind}"),
            Self::InvalidTransition { entity, .. } => format!("{entity} is not in a processable state"),
            Self::NotFound { kind, .. } => format!("{kind} not found"),
            Self::BusinessRule(msg) => msg.clone(),
            Self::Validation(_) | Self::Configuration(_) => "request rejected by validation".to_string(),
            Self::Duplicate { .. } => "already processed".to_string(),
            Self::Remote { .. }
            | Self::Saga(_)
            | Self::Timeout(_)
            | Self::StageClosed { .. }
            | Self::LeaseUnavailable { .. } => "temporarily unavailable, will be retried".to_string(),
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Failure of a saga submitted to the dispatcher.
///
/// When a forward action fails, the error returned to the caller is the forward
/// action's own error, after compensation has run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SagaError {
    #[error("saga {gid} has no actions")]
    Empty { gid: String },

    #[error("saga {gid}: reversible action {service}/{action} registered after a non-reversible action")]
    ReversibleAfterTerminal {
        gid: String,
        service: String,
        action: String,
    },

    #[error("saga step {step} {service}/{action} failed: {message}")]
    ActionFailed {
        step: usize,
        service: String,
        action: String,
        message: String,
    },

    #[error("saga step {step} {service}/{action} timed out after {timeout:?}")]
    ActionTimedOut {
        step: usize,
        service: String,
        action: String,
        timeout: Duration,
    },

    #[error("{original}; compensation {service}/{compensate} failed after {attempts} attempts: {message}")]
    CompensationFailed {
        #[source]
        original: Box<SagaError>,
        service: String,
        compensate: String,
        attempts: u32,
        message: String,
    },
}

impl SagaError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Empty { .. } | Self::ReversibleAfterTerminal { .. })
    }

    /// The forward failure that triggered compensation.
    pub fn original(&self) -> &SagaError {
        match self {
            Self::CompensationFailed { original, .. } => original.original(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_routing() {
        assert_eq!(
            PipelineError::remote("ledger", "connection reset").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            PipelineError::InvalidDecimal {
                field: "amount".into(),
                value: "abc".into()
            }
            .category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            PipelineError::Duplicate { key: "g1@100".into() }.category(),
            ErrorCategory::Duplicate
        );
    }

    #[test]
    fn test_saga_error_category() {
        let failed = SagaError::ActionFailed {
            step: 2,
            service: "ledger".into(),
            action: "CreateStatements".into(),
            message: "boom".into(),
        };
        assert!(PipelineError::from(failed.clone()).is_transient());

        let malformed = SagaError::Empty { gid: "g".into() };
        assert!(!PipelineError::from(malformed).is_transient());

        let wrapped = SagaError::CompensationFailed {
            original: Box::new(failed.clone()),
            service: "good".into(),
            compensate: "DeleteGoodStatement".into(),
            attempts: 3,
            message: "down".into(),
        };
        assert_eq!(wrapped.original(), &failed);
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = PipelineError::remote("ledger.v1", "dial tcp 10.0.0.7:50051: refused");
        let msg = err.user_message();
        assert!(!msg.contains("10.0.0.7"));
        assert!(!msg.contains("ledger.v1"));

        let rule = PipelineError::BusinessRule("insufficient funds".into());
        assert_eq!(rule.user_message(), "insufficient funds");
    }
}
