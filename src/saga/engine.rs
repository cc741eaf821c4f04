//! Saga execution engines.
//!
//! [`InProcessSagaEngine`] runs forward actions sequentially through an
//! [`RpcInvoker`]. When forward action N fails, actions N-1..1 are compensated
//! in reverse registration order, each exactly once on success (compensators
//! are retried only while they fail), before the forward error is returned.
//! Compensation does not observe any cancellation token: once admitted, a
//! saga always finishes its rollback.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::dispose::{SagaAction, SagaDispose};
use crate::error::SagaError;

/// Transport to the services a saga touches.
///
/// Every method must be idempotent under the saga `gid` and the entity ID in
/// its payload, since redelivery is expected.
#[async_trait]
pub trait RpcInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        gid: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SagaEngine: Send + Sync {
    async fn execute(&self, dispose: &SagaDispose) -> Result<(), SagaError>;
}

pub struct InProcessSagaEngine {
    invoker: Arc<dyn RpcInvoker>,
}

impl InProcessSagaEngine {
    pub fn new(invoker: Arc<dyn RpcInvoker>) -> Self {
        Self { invoker }
    }

    async fn forward(&self, dispose: &SagaDispose, step: usize, action: &SagaAction, started: Instant) -> Result<(), SagaError> {
        let options = dispose.options();
        let remaining = options.timeout_to_fail.saturating_sub(started.elapsed());
        let timeout = options.request_timeout.min(remaining);

        let timed_out = || SagaError::ActionTimedOut {
            step,
            service: action.service.clone(),
            action: action.action.clone(),
            timeout,
        };
        if timeout.is_zero() {
            return Err(timed_out());
        }

        match tokio::time::timeout(
            timeout,
            self.invoker
                .invoke(&action.service, &action.action, dispose.gid(), &action.payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SagaError::ActionFailed {
                step,
                service: action.service.clone(),
                action: action.action.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(timed_out()),
        }
    }

    async fn compensate(&self, dispose: &SagaDispose, applied: &[usize], original: SagaError) -> SagaError {
        let options = dispose.options();
        let mut failure: Option<SagaError> = None;

        for &index in applied.iter().rev() {
            let action = &dispose.actions()[index];
            let Some(compensate) = action.compensate.as_deref() else {
                warn!(
                    gid = %dispose.gid(),
                    step = index + 1,
                    service = %action.service,
                    action = %action.action,
                    "Applied action has no compensator"
                );
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self
                    .invoker
                    .invoke(&action.service, compensate, dispose.gid(), &action.payload)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            gid = %dispose.gid(),
                            step = index + 1,
                            service = %action.service,
                            compensate = %compensate,
                            attempt,
                            "Compensated"
                        );
                        break;
                    }
                    Err(e) if attempt < options.compensation_attempts => {
                        warn!(
                            gid = %dispose.gid(),
                            service = %action.service,
                            compensate = %compensate,
                            attempt,
                            error = %e,
                            "Compensation failed, retrying"
                        );
                        tokio::time::sleep(options.retry_interval).await;
                    }
                    Err(e) => {
                        error!(
                            gid = %dispose.gid(),
                            service = %action.service,
                            compensate = %compensate,
                            attempts = attempt,
                            error = %e,
                            "Compensation exhausted"
                        );
                        if failure.is_none() {
                            failure = Some(SagaError::CompensationFailed {
                                original: Box::new(original.clone()),
                                service: action.service.clone(),
                                compensate: compensate.to_string(),
                                attempts: attempt,
                                message: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }

        failure.unwrap_or(original)
    }
}

#[async_trait]
impl SagaEngine for InProcessSagaEngine {
    async fn execute(&self, dispose: &SagaDispose) -> Result<(), SagaError> {
        dispose.validate()?;

        let started = Instant::now();
        let mut applied = Vec::with_capacity(dispose.len());

        for (index, action) in dispose.actions().iter().enumerate() {
            match self.forward(dispose, index + 1, action, started).await {
                Ok(()) => applied.push(index),
                Err(err) => {
                    warn!(
                        gid = %dispose.gid(),
                        error = %err,
                        compensating = applied.len(),
                        "Saga forward action failed"
                    );
                    return Err(self.compensate(dispose, &applied, err).await);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_invoker {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every call; methods listed in `failures` fail that many times
    /// (`u32::MAX` for always).
    #[derive(Default)]
    pub struct ScriptedInvoker {
        pub calls: Mutex<Vec<(String, String)>>,
        pub failures: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedInvoker {
        pub fn failing(method: &str, times: u32) -> Self {
            let invoker = Self::default();
            invoker.failures.lock().insert(method.to_string(), times);
            invoker
        }

        pub fn methods(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(_, m)| m.clone()).collect()
        }
    }

    #[async_trait]
    impl RpcInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            service: &str,
            method: &str,
            _gid: &str,
            _payload: &serde_json::Value,
        ) -> anyhow::Result<()> {
            self.calls.lock().push((service.to_string(), method.to_string()));
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(method) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    anyhow::bail!("{method} rejected");
                }
            }
            Ok(())
        }
    }
}
