use std::collections::BTreeSet;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, InstanceQuery, NewEvent, SearchQuery};

use super::r#trait::{EventSource, EventStoreError};

/// In-memory event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push with an explicit creation date.
    pub fn push_at(
        &self,
        events: Vec<NewEvent>,
        creation_date: DateTime<Utc>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let mut log = self
            .events
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let mut committed = Vec::with_capacity(events.len());
        for new in events {
            let previous_aggregate_sequence = log
                .iter()
                .rev()
                .find(|e| {
                    e.instance_id == new.instance_id
                        && e.aggregate_type == new.aggregate_type
                        && e.aggregate_id == new.aggregate_id
                })
                .map_or(0, |e| e.sequence);
            let previous_aggregate_type_sequence = log
                .iter()
                .rev()
                .find(|e| e.instance_id == new.instance_id && e.aggregate_type == new.aggregate_type)
                .map_or(0, |e| e.sequence);

            let event = Event {
                aggregate_type: new.aggregate_type,
                aggregate_id: new.aggregate_id,
                instance_id: new.instance_id,
                event_type: new.event_type,
                sequence: log.last().map_or(0, |e| e.sequence) + 1,
                previous_aggregate_sequence,
                previous_aggregate_type_sequence,
                creation_date,
                payload: new.payload,
            };
            log.push(event.clone());
            committed.push(event);
        }

        Ok(committed)
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl EventSource for InMemoryEventSource {
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        let log = self
            .events
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(log
            .iter()
            .filter(|event| query.matches(event))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn push(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventStoreError> {
        self.push_at(events, Utc::now())
    }

    async fn instance_ids(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<InstanceId>, EventStoreError> {
        let log = self
            .events
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let ids: BTreeSet<InstanceId> = log
            .iter()
            .filter(|event| query.matches(event))
            .map(|event| event.instance_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
