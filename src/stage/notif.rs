//! Notification stage and the default [`Notify`] implementation.
//!
//! Terminal failures and operator-relevant successes end up here. Only the
//! rendered message leaves the pipeline; raw error text never does.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::worker::{StageHandler, StageWorker};
use super::{Entity, Notify, ObjectId};
use crate::error::Result;
use crate::services::{NotifResult, Notification, NotificationService};

/// An envelope that knows how it should be reported.
pub trait Notifiable: ObjectId {
    fn notification(&self) -> (NotifResult, String);
}

pub struct NotifStage<P: Entity> {
    notify: Arc<dyn Notify<P>>,
}

impl<P: Entity> NotifStage<P> {
    pub fn new(notify: Arc<dyn Notify<P>>) -> Self {
        Self { notify }
    }
}

#[async_trait]
impl<P: Entity> StageHandler<P> for NotifStage<P> {
    async fn handle(&self, token: &CancellationToken, envelope: P) -> Result<()> {
        self.notify.notify(token, &envelope).await
    }
}

pub fn spawn_notif<P: Entity>(
    subsystem: &str,
    capacity: usize,
    token: CancellationToken,
    notify: Arc<dyn Notify<P>>,
) -> StageWorker<P> {
    StageWorker::spawn(
        format!("{subsystem}:notif"),
        capacity,
        token,
        NotifStage::new(notify),
    )
}

/// Stores one [`Notification`] per envelope through a [`NotificationService`].
pub struct NotificationPersister {
    subsystem: String,
    service: Arc<dyn NotificationService>,
}

impl NotificationPersister {
    pub fn new(subsystem: impl Into<String>, service: Arc<dyn NotificationService>) -> Self {
        Self {
            subsystem: subsystem.into(),
            service,
        }
    }
}

#[async_trait]
impl<P: Entity + Notifiable> Notify<P> for NotificationPersister {
    async fn notify(&self, _token: &CancellationToken, envelope: &P) -> Result<()> {
        let (result, message) = envelope.notification();
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            subsystem: self.subsystem.clone(),
            object_id: envelope.object_id(),
            result,
            message,
            created_at: Utc::now(),
        };

        match notification.result {
            NotifResult::Success => debug!(
                subsystem = %self.subsystem,
                object_id = %notification.object_id,
                "Storing success notification"
            ),
            NotifResult::Fail => info!(
                subsystem = %self.subsystem,
                object_id = %notification.object_id,
                message = %notification.message,
                "Storing failure notification"
            ),
        }
        self.service.create_notification(notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InMemoryPlatform;
    use crate::stage::test_support::Envelope;
    use crate::stage::Reportable;

    impl Notifiable for Envelope {
        fn notification(&self) -> (NotifResult, String) {
            match &self.failure {
                Some(message) => (NotifResult::Fail, message.clone()),
                None => (NotifResult::Success, format!("doubled to {}", self.doubled)),
            }
        }
    }

    #[tokio::test]
    async fn test_failure_is_stored_with_user_message() {
        let platform = Arc::new(InMemoryPlatform::new());
        let persister = NotificationPersister::new("test", platform.clone());
        let mut envelope = Envelope {
            id: "w1".into(),
            doubled: 0,
            failure: None,
        };
        envelope.record_failure("insufficient funds".into());

        persister
            .notify(&CancellationToken::new(), &envelope)
            .await
            .unwrap();

        let stored = platform.notifications().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subsystem, "test");
        assert_eq!(stored[0].object_id, "w1");
        assert_eq!(stored[0].result, NotifResult::Fail);
        assert_eq!(stored[0].message, "insufficient funds");
    }

    #[tokio::test]
    async fn test_stage_drains_into_persister() {
        let platform = Arc::new(InMemoryPlatform::new());
        let token = CancellationToken::new();
        let persister: Arc<dyn Notify<Envelope>> =
            Arc::new(NotificationPersister::new("test", platform.clone()));
        let worker = spawn_notif("test", 4, token.clone(), persister);

        worker
            .feed(Envelope {
                id: "g1".into(),
                doubled: 4,
                failure: None,
            })
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while platform.notifications().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(platform.notifications().await[0].message, "doubled to 4");
        token.cancel();
    }
}
