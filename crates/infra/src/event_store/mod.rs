//! Event source boundary.
//!
//! The projection engine only reads events (`filter`, `instance_ids`) and
//! pushes its own scheduler marker; everything else about the log is owned by
//! the write side.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventSource;
pub use postgres::PostgresEventSource;
pub use r#trait::{EventSource, EventStoreError};

use tracing::warn;

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, EventBus, InstanceQuery, NewEvent, SearchQuery};

/// Adapter that publishes pushed events to an `EventBus` after the push
/// succeeded.
///
/// This keeps the ordering invariant: **publish happens only after push**.
/// Publishing is best-effort. Once the push committed, a publish failure is
/// logged and the push still succeeds; the scheduler picks up whatever the
/// subscribers missed.
pub struct PublishingEventSource<S, B> {
    source: S,
    bus: B,
}

impl<S, B> PublishingEventSource<S, B> {
    pub fn new(source: S, bus: B) -> Self {
        Self { source, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.source, self.bus)
    }
}

#[async_trait::async_trait]
impl<S, B> EventSource for PublishingEventSource<S, B>
where
    S: EventSource,
    B: EventBus<Event>,
{
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        self.source.filter(query).await
    }

    async fn push(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventStoreError> {
        // 1) Push (durable step)
        let committed = self.source.push(events).await?;

        // 2) Publish (best-effort; subscribers are idempotent)
        for event in &committed {
            if let Err(err) = self.bus.publish(event.clone()) {
                warn!(
                    instance_id = %event.instance_id,
                    aggregate_type = %event.aggregate_type,
                    sequence = event.sequence,
                    error = ?err,
                    "publishing pushed event failed"
                );
            }
        }

        Ok(committed)
    }

    async fn instance_ids(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<InstanceId>, EventStoreError> {
        self.source.instance_ids(query).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use forgeiam_events::{InMemoryEventBus, Subscription};
    use serde_json::json;

    use super::*;

    struct ClosedBus;

    impl EventBus<Event> for ClosedBus {
        type Error = &'static str;

        fn publish(&self, _message: Event) -> Result<(), Self::Error> {
            Err("bus closed")
        }

        fn subscribe(&self) -> Subscription<Event> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Subscription::new(rx)
        }
    }

    fn user_added(id: &str) -> NewEvent {
        NewEvent::new(
            InstanceId::from("acme"),
            "user".into(),
            id.to_string().into(),
            "user.added".into(),
            json!({}),
        )
    }

    #[tokio::test]
    async fn pushed_events_are_published_in_order() {
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let mut subscription = bus.subscribe();
        let source = PublishingEventSource::new(InMemoryEventSource::new(), bus.clone());

        let pushed = source
            .push(vec![user_added("u1"), user_added("u2")])
            .await
            .unwrap();

        let received = subscription.recv_batch().await;
        assert_eq!(received, pushed);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_committed_push() {
        let source = PublishingEventSource::new(InMemoryEventSource::new(), ClosedBus);

        let pushed = source.push(vec![user_added("u1")]).await.unwrap();

        assert_eq!(pushed.len(), 1);
        let (log, _) = source.into_parts();
        assert_eq!(log.len(), 1);
    }
}
