use std::sync::Arc;

use thiserror::Error;

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, InstanceQuery, NewEvent, SearchQuery};

/// Event source operation error.
///
/// These are **infrastructure errors** (storage, invalid input) as opposed to
/// reduction or statement errors.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event storage failed: {0}")]
    Storage(String),

    #[error("invalid push: {0}")]
    InvalidPush(String),
}

/// Append-only, sequenced event log as consumed by the projection engine.
///
/// ## Ordering
///
/// `filter` returns events ascending by `sequence`; events of one aggregate are
/// therefore always returned in the order they were pushed.
///
/// ## Push
///
/// `push` assigns the sequence and both previous-sequence back references and
/// persists the batch atomically (all or nothing).
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError>;

    async fn push(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventStoreError>;

    /// Distinct instance ids with at least one event matching `query`.
    async fn instance_ids(&self, query: &InstanceQuery)
    -> Result<Vec<InstanceId>, EventStoreError>;
}

#[async_trait::async_trait]
impl<S> EventSource for Arc<S>
where
    S: EventSource + ?Sized,
{
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        (**self).filter(query).await
    }

    async fn push(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventStoreError> {
        (**self).push(events).await
    }

    async fn instance_ids(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<InstanceId>, EventStoreError> {
        (**self).instance_ids(query).await
    }
}
