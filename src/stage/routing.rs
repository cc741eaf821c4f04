//! Outbound edges of the executor and persistent stages.
//!
//! Every send here is an [`async_feed`]: the calling stage never waits for a
//! slow consumer, and cancellation of the subsystem token drops pending sends.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Entity, Payload, Reportable};
use crate::error::{ErrorCategory, PipelineError};
use crate::feed::{async_feed, FeedOutcome, RetryScheduler};

/// The channel roles a stage can route to.
pub struct Routes<E, P> {
    subsystem: String,
    token: CancellationToken,
    persistent: mpsc::Sender<P>,
    notif: mpsc::Sender<P>,
    done: mpsc::Sender<Payload<E, P>>,
    retry: mpsc::Sender<Payload<E, P>>,
    retrier: RetryScheduler,
}

impl<E, P> Clone for Routes<E, P> {
    fn clone(&self) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            token: self.token.clone(),
            persistent: self.persistent.clone(),
            notif: self.notif.clone(),
            done: self.done.clone(),
            retry: self.retry.clone(),
            retrier: self.retrier.clone(),
        }
    }
}

/// Terminal routing decision for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Route<E, P> {
    /// A meaningful result to commit.
    Persistent(P),
    /// Nothing to do; release the entity.
    Done(Payload<E, P>),
    /// Report the envelope, usually a terminal failure, then release the entity.
    Notify { envelope: P, done: Payload<E, P> },
    /// Transient failure: release the entity and re-submit it after the cooldown.
    Retry(Payload<E, P>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Persistent,
    Done,
    Notify,
    Retry,
}

impl<E, P: Reportable> Route<E, P> {
    /// Route a failure by its category.
    ///
    /// Duplicates count as success and only release the entity.
    pub fn failed(error: &PipelineError, mut envelope: P, payload: Payload<E, P>) -> Self {
        match error.category() {
            ErrorCategory::Duplicate => Self::Done(payload),
            ErrorCategory::Transient => Self::Retry(payload),
            ErrorCategory::Validation => {
                envelope.record_failure(error.user_message());
                Self::Notify {
                    envelope,
                    done: payload,
                }
            }
        }
    }
}

impl<E, P> Route<E, P> {
    pub fn kind(&self) -> RouteKind {
        match self {
            Self::Persistent(_) => RouteKind::Persistent,
            Self::Done(_) => RouteKind::Done,
            Self::Notify { .. } => RouteKind::Notify,
            Self::Retry(_) => RouteKind::Retry,
        }
    }
}

impl<E: Entity, P: Entity> Routes<E, P> {
    pub fn new(
        subsystem: impl Into<String>,
        token: CancellationToken,
        persistent: mpsc::Sender<P>,
        notif: mpsc::Sender<P>,
        done: mpsc::Sender<Payload<E, P>>,
        retry: mpsc::Sender<Payload<E, P>>,
        retrier: RetryScheduler,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            token,
            persistent,
            notif,
            done,
            retry,
            retrier,
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn retrier(&self) -> &RetryScheduler {
        &self.retrier
    }

    pub fn to_persistent(&self, envelope: P) -> JoinHandle<FeedOutcome> {
        async_feed(&self.token, envelope, &self.persistent)
    }

    pub fn to_notif(&self, envelope: P) -> JoinHandle<FeedOutcome> {
        async_feed(&self.token, envelope, &self.notif)
    }

    pub fn to_done(&self, payload: Payload<E, P>) -> JoinHandle<FeedOutcome> {
        async_feed(&self.token, payload, &self.done)
    }

    pub fn retry_later(&self, payload: Payload<E, P>) -> JoinHandle<FeedOutcome> {
        self.retrier.schedule(payload, &self.retry)
    }

    /// Perform exactly one terminal routing decision.
    pub fn dispatch(&self, route: Route<E, P>) -> RouteKind {
        let kind = route.kind();
        match route {
            Route::Persistent(envelope) => {
                debug!(subsystem = %self.subsystem, object_id = %envelope.object_id(), "→ persistent");
                self.to_persistent(envelope);
            }
            Route::Done(payload) => {
                debug!(subsystem = %self.subsystem, object_id = %payload.object_id(), "→ done");
                self.to_done(payload);
            }
            Route::Notify { envelope, done } => {
                debug!(subsystem = %self.subsystem, object_id = %envelope.object_id(), "→ notif + done");
                self.to_notif(envelope);
                self.to_done(done);
            }
            Route::Retry(payload) => {
                debug!(
                    subsystem = %self.subsystem,
                    object_id = %payload.object_id(),
                    cooldown_ms = self.retrier.cooldown().as_millis() as u64,
                    "→ retry + done"
                );
                self.to_done(payload.clone());
                self.retry_later(payload);
            }
        }
        kind
    }
}

/// Releases an entity on `done` when dropped, on every return path.
pub struct DoneGuard<E: Entity, P: Entity> {
    routes: Routes<E, P>,
    payload: Option<Payload<E, P>>,
}

impl<E: Entity, P: Entity> DoneGuard<E, P> {
    pub fn new(routes: &Routes<E, P>, payload: Payload<E, P>) -> Self {
        Self {
            routes: routes.clone(),
            payload: Some(payload),
        }
    }
}

impl<E: Entity, P: Entity> Drop for DoneGuard<E, P> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.routes.to_done(payload);
        }
    }
}
