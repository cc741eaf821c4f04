//! Executor stage: feeds exec-channel payloads into an [`Exec`] implementation.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::routing::{Route, Routes};
use super::worker::{StageHandler, StageWorker};
use super::{Entity, Exec, Payload};
use crate::error::Result;

pub struct ExecStage<E: Entity, P: Entity> {
    exec: Arc<dyn Exec<E, P>>,
    routes: Routes<E, P>,
}

impl<E: Entity, P: Entity> ExecStage<E, P> {
    pub fn new(exec: Arc<dyn Exec<E, P>>, routes: Routes<E, P>) -> Self {
        Self { exec, routes }
    }
}

#[async_trait]
impl<E: Entity, P: Entity> StageHandler<Payload<E, P>> for ExecStage<E, P> {
    async fn handle(&self, token: &CancellationToken, payload: Payload<E, P>) -> Result<()> {
        match payload {
            // Already computed; a retried commit goes straight back to persistent
            Payload::Envelope(envelope) => {
                self.routes.dispatch(Route::Persistent(envelope));
                Ok(())
            }
            payload => self.exec.exec(token, payload, &self.routes).await,
        }
    }
}

pub fn spawn_executor<E: Entity, P: Entity>(
    subsystem: &str,
    index: usize,
    capacity: usize,
    token: CancellationToken,
    exec: Arc<dyn Exec<E, P>>,
    routes: Routes<E, P>,
) -> StageWorker<Payload<E, P>> {
    StageWorker::spawn(
        format!("{subsystem}:executor:{index}"),
        capacity,
        token,
        ExecStage::new(exec, routes),
    )
}
