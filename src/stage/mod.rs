//! # Pipeline Stages
//!
//! Contracts and wiring for the three-stage pipeline every subsystem runs:
//!
//! ```text
//!  Scanner ──exec──▶ handler loop ──▶ Executor ──persistent──▶ handler loop ──▶ Persistent
//!     ▲                 │  ▲                         │                           │
//!     └──── retry ◀─────┘  └──────── done / notif ◀──┴───────────────────────────┘
//! ```
//!
//! - [`Scanner`] discovers entities and feeds them into the exec channel.
//! - [`Exec`] computes one entity and makes exactly one routing decision.
//! - [`Persistenter`] commits the computed envelope, usually through a saga.
//! - [`Notify`] renders operator/user notifications.
//!
//! Payloads travel as the tagged union [`Payload`], so a stage always knows
//! which of the three shapes it holds and every shape resolves a stable ID.

pub mod executor;
pub mod handler;
pub mod notif;
pub mod persistent;
pub mod routing;
pub mod running;
pub mod sentinel;
pub mod worker;

use async_trait::async_trait;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use handler::{PipelineBuilder, PipelineHandler};
pub use routing::{DoneGuard, Route, RouteKind, Routes};
pub use running::{Admission, RunningMap};
pub use sentinel::Sentinel;
pub use worker::{StageHandler, StageWorker};

/// Stable identity of a business entity or envelope.
pub trait ObjectId {
    fn object_id(&self) -> String;
}

/// Bounds shared by every value flowing through a pipeline.
pub trait Entity: ObjectId + Clone + Debug + Send + Sync + 'static {}

impl<T> Entity for T where T: ObjectId + Clone + Debug + Send + Sync + 'static {}

/// Envelopes carry the failure text shown on the notification side channel.
pub trait Reportable {
    fn record_failure(&mut self, message: String);
}

/// An entity fed by an operator trigger, with the checkpoint it was
/// triggered for.
#[derive(Debug, Clone, PartialEq)]
pub struct Triggered<E> {
    pub entity: E,
    pub checkpoint: Option<u32>,
}

/// The three payload shapes a pipeline channel carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<E, P> {
    /// A raw record found by a scan.
    Entity(E),
    /// A record found by a triggered scan.
    Triggered(Triggered<E>),
    /// A computed envelope re-entering the pipeline, e.g. after a retry.
    Envelope(P),
}

impl<E: ObjectId, P: ObjectId> Payload<E, P> {
    pub fn object_id(&self) -> String {
        match self {
            Self::Entity(e) => e.object_id(),
            Self::Triggered(t) => t.entity.object_id(),
            Self::Envelope(p) => p.object_id(),
        }
    }
}

impl<E, P> Payload<E, P> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Triggered(_) => "triggered",
            Self::Envelope(_) => "envelope",
        }
    }

    pub fn triggered(entity: E, checkpoint: Option<u32>) -> Self {
        Self::Triggered(Triggered { entity, checkpoint })
    }
}

/// Operator-supplied condition for a narrowed rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerCond {
    /// Explicit object IDs. Empty means every eligible object.
    pub object_ids: Vec<String>,
    /// Explicit checkpoint timestamp (unix seconds).
    pub checkpoint: Option<u32>,
}

impl TriggerCond {
    pub fn contains(&self, object_id: &str) -> bool {
        self.object_ids.is_empty() || self.object_ids.iter().any(|id| id == object_id)
    }
}

pub type ExecSender<E, P> = mpsc::Sender<Payload<E, P>>;

/// Discovers entities due for a stage.
///
/// Query errors abort only the current pass; the sentinel logs them and the
/// next tick starts a fresh, idempotent pass.
#[async_trait]
pub trait Scanner<E: Entity, P: Entity>: Send + Sync {
    async fn scan(&self, token: &CancellationToken, exec: &ExecSender<E, P>) -> Result<()>;

    /// One-time catch-up pass at start.
    async fn init_scan(&self, _token: &CancellationToken, _exec: &ExecSender<E, P>) -> Result<()> {
        Ok(())
    }

    /// Narrowed scan requested by an operator.
    async fn trigger_scan(
        &self,
        _token: &CancellationToken,
        _cond: &TriggerCond,
        _exec: &ExecSender<E, P>,
    ) -> Result<()> {
        Ok(())
    }

    fn object_id(&self, payload: &Payload<E, P>) -> String {
        payload.object_id()
    }
}

/// Computes the outcome for one entity.
///
/// Implementations read and compute only; every external mutation belongs to
/// the [`Persistenter`]. Exactly one routing decision is dispatched through
/// `routes` per call, on every return path.
#[async_trait]
pub trait Exec<E: Entity, P: Entity>: Send + Sync {
    async fn exec(
        &self,
        token: &CancellationToken,
        payload: Payload<E, P>,
        routes: &Routes<E, P>,
    ) -> Result<()>;
}

/// Durably commits a computed envelope.
///
/// The persistent stage releases the entity on `done` after every call. A
/// returned error is routed by category: transient errors schedule a retry,
/// validation errors go to the notification stage, duplicates are dropped.
#[async_trait]
pub trait Persistenter<E: Entity, P: Entity>: Send + Sync {
    async fn update(&self, token: &CancellationToken, envelope: &P, routes: &Routes<E, P>) -> Result<()>;
}

/// Renders and stores a notification for a terminal failure or an
/// operator-relevant success.
#[async_trait]
pub trait Notify<P: Entity>: Send + Sync {
    async fn notify(&self, token: &CancellationToken, envelope: &P) -> Result<()>;
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_object_id_for_every_shape() {
        let raw: Payload<Item, Envelope> = Payload::Entity(item("a", 1));
        let triggered: Payload<Item, Envelope> = Payload::triggered(item("a", 1), Some(86_400));
        let envelope: Payload<Item, Envelope> = Payload::Envelope(Envelope {
            id: "a".into(),
            doubled: 2,
            failure: None,
        });

        assert_eq!(raw.object_id(), "a");
        assert_eq!(triggered.object_id(), "a");
        assert_eq!(envelope.object_id(), "a");
        assert_eq!(triggered.kind(), "triggered");
    }

    #[test]
    fn test_trigger_cond_contains() {
        let all = TriggerCond::default();
        assert!(all.contains("anything"));

        let narrowed = TriggerCond {
            object_ids: vec!["g1".into()],
            checkpoint: None,
        };
        assert!(narrowed.contains("g1"));
        assert!(!narrowed.contains("g2"));
    }
}
