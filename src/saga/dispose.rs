//! Saga construction.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SagaConfig;
use crate::error::{PipelineError, Result, SagaError};

/// One forward RPC with its optional compensator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaAction {
    pub service: String,
    pub action: String,
    /// `None` marks a non-reversible action.
    pub compensate: Option<String>,
    /// Request body shared by the forward action and its compensator.
    pub payload: serde_json::Value,
}

impl SagaAction {
    pub fn is_reversible(&self) -> bool {
        self.compensate.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransOptions {
    /// Wait for the saga to finish before returning.
    pub wait_result: bool,
    /// Per-action timeout.
    pub request_timeout: Duration,
    /// Budget for the whole forward phase.
    pub timeout_to_fail: Duration,
    /// Pause between compensation attempts.
    pub retry_interval: Duration,
    pub compensation_attempts: u32,
}

impl Default for TransOptions {
    fn default() -> Self {
        Self::from(&SagaConfig::default())
    }
}

impl From<&SagaConfig> for TransOptions {
    fn from(config: &SagaConfig) -> Self {
        Self {
            wait_result: config.wait_result,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            timeout_to_fail: Duration::from_secs(config.timeout_to_fail_secs),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            compensation_attempts: config.compensation_attempts.max(1),
        }
    }
}

/// Ordered saga under construction.
///
/// Persistent handlers register one action per remote mutation. Actions
/// without a compensator cannot be rolled back, so they must come after every
/// reversible action; [`SagaDispose::validate`] enforces that.
#[derive(Debug, Clone)]
pub struct SagaDispose {
    gid: String,
    options: TransOptions,
    actions: Vec<SagaAction>,
}

impl SagaDispose {
    pub fn new(options: TransOptions) -> Self {
        Self::with_gid(Uuid::new_v4().to_string(), options)
    }

    pub fn with_gid(gid: impl Into<String>, options: TransOptions) -> Self {
        Self {
            gid: gid.into(),
            options,
            actions: Vec::new(),
        }
    }

    /// Register `action` on `service`. An empty `compensate` registers a
    /// non-reversible action.
    pub fn add<T: Serialize>(
        &mut self,
        service: &str,
        action: &str,
        compensate: &str,
        request: &T,
    ) -> Result<&mut Self> {
        let payload = serde_json::to_value(request).map_err(|e| {
            PipelineError::validation(format!("failed to encode {service}/{action} request: {e}"))
        })?;
        self.actions.push(SagaAction {
            service: service.to_string(),
            action: action.to_string(),
            compensate: (!compensate.is_empty()).then(|| compensate.to_string()),
            payload,
        });
        Ok(self)
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    pub fn options(&self) -> &TransOptions {
        &self.options
    }

    pub fn actions(&self) -> &[SagaAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn validate(&self) -> std::result::Result<(), SagaError> {
        if self.actions.is_empty() {
            return Err(SagaError::Empty {
                gid: self.gid.clone(),
            });
        }

        let mut seen_terminal = false;
        for action in &self.actions {
            if !action.is_reversible() {
                seen_terminal = true;
            } else if seen_terminal {
                return Err(SagaError::ReversibleAfterTerminal {
                    gid: self.gid.clone(),
                    service: action.service.clone(),
                    action: action.action.clone(),
                });
            }
        }
        Ok(())
    }
}
