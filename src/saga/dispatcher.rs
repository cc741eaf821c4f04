//! Saga dispatcher: audit logging and timing around a [`SagaEngine`].

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

use super::dispose::SagaDispose;
use super::engine::SagaEngine;
use crate::error::Result;

#[derive(Clone)]
pub struct SagaDispatcher {
    engine: Arc<dyn SagaEngine>,
}

impl SagaDispatcher {
    pub fn new(engine: Arc<dyn SagaEngine>) -> Self {
        Self { engine }
    }

    /// Validate, log every registered action, run the saga and report the
    /// terminal result. Any compensation has finished when this returns.
    ///
    /// With `wait_result` off the saga runs in the background and this
    /// returns once it has been admitted.
    #[instrument(skip(self, dispose), fields(gid = %dispose.gid(), actions = dispose.len()))]
    pub async fn execute(&self, dispose: SagaDispose) -> Result<()> {
        dispose.validate()?;

        for (index, action) in dispose.actions().iter().enumerate() {
            info!(
                step = index + 1,
                service = %action.service,
                rpc = %action.action,
                compensate = action.compensate.as_deref().unwrap_or(""),
                reversible = action.is_reversible(),
                "Saga action"
            );
        }

        if !dispose.options().wait_result {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                if let Err(e) = engine.execute(&dispose).await {
                    error!(
                        gid = %dispose.gid(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "❌ Background saga failed"
                    );
                }
            });
            return Ok(());
        }

        let start = Instant::now();
        let result = self.engine.execute(&dispose).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(elapsed_ms, "✅ Saga committed"),
            Err(e) => error!(elapsed_ms, error = %e, "❌ Saga failed"),
        }
        result.map_err(Into::into)
    }
}
