//! Persistent stage: commits envelopes through a [`Persistenter`].
//!
//! The entity is released on `done` after every call through a [`DoneGuard`].
//! A failed commit takes exactly one further path, picked by error category.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::routing::{DoneGuard, Routes};
use super::worker::{StageHandler, StageWorker};
use super::{Entity, Payload, Persistenter, Reportable};
use crate::error::{ErrorCategory, Result};

pub struct PersistentStage<E: Entity, P: Entity> {
    persistenter: Arc<dyn Persistenter<E, P>>,
    routes: Routes<E, P>,
}

impl<E: Entity, P: Entity> PersistentStage<E, P> {
    pub fn new(persistenter: Arc<dyn Persistenter<E, P>>, routes: Routes<E, P>) -> Self {
        Self {
            persistenter,
            routes,
        }
    }
}

#[async_trait]
impl<E, P> StageHandler<P> for PersistentStage<E, P>
where
    E: Entity,
    P: Entity + Reportable,
{
    async fn handle(&self, token: &CancellationToken, envelope: P) -> Result<()> {
        let _done = DoneGuard::new(&self.routes, Payload::Envelope(envelope.clone()));

        let err = match self.persistenter.update(token, &envelope, &self.routes).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        match err.category() {
            ErrorCategory::Duplicate => {
                debug!(
                    subsystem = %self.routes.subsystem(),
                    object_id = %envelope.object_id(),
                    "Commit already applied"
                );
                Ok(())
            }
            ErrorCategory::Transient => {
                warn!(
                    subsystem = %self.routes.subsystem(),
                    object_id = %envelope.object_id(),
                    error = %err,
                    "Commit failed, scheduling retry"
                );
                self.routes.retry_later(Payload::Envelope(envelope));
                Err(err)
            }
            ErrorCategory::Validation => {
                let mut envelope = envelope;
                envelope.record_failure(err.user_message());
                self.routes.to_notif(envelope);
                Err(err)
            }
        }
    }
}

pub fn spawn_persistent<E, P>(
    subsystem: &str,
    capacity: usize,
    token: CancellationToken,
    persistenter: Arc<dyn Persistenter<E, P>>,
    routes: Routes<E, P>,
) -> StageWorker<P>
where
    E: Entity,
    P: Entity + Reportable,
{
    StageWorker::spawn(
        format!("{subsystem}:persistent"),
        capacity,
        token,
        PersistentStage::new(persistenter, routes),
    )
}
