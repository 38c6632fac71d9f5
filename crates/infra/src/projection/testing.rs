//! Shared fixtures for projection engine tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use forgeiam_core::InstanceId;
use forgeiam_events::{
    AggregateReducer, Column, Condition, Event, NewEvent, Projection, ReduceError, SqlValue,
    Statement, decode_payload,
};

use crate::config::ProjectionConfig;
use crate::event_store::{EventSource, InMemoryEventSource};
use crate::lock::{InMemoryLocker, LockTable};

use super::handler::ProjectionHandler;
use super::in_memory::InMemoryProjectionStore;
use super::statement_handler::StatementHandler;

pub(crate) const TEST_PROJECTION: &str = "projections.test";
pub(crate) const TABLE: &str = "projections.test_rows";
pub(crate) const AGGREGATE: &str = "x";
pub(crate) const ADDED: &str = "x.added";
pub(crate) const RENAMED: &str = "x.renamed";

#[derive(Debug, Deserialize)]
struct Named {
    name: Option<String>,
}

fn name_of(event: &Event) -> Result<String, ReduceError> {
    decode_payload::<Named>(event)?
        .name
        .ok_or_else(|| ReduceError::invalid(event, "missing name"))
}

fn reduce_added(event: &Event) -> Result<Statement, ReduceError> {
    Ok(Statement::upsert(
        event,
        TABLE,
        vec![
            Column::new("instance_id", event.instance_id.as_str()),
            Column::new("id", event.aggregate_id.as_str()),
            Column::new("name", name_of(event)?),
            Column::new("sequence", event.sequence),
        ],
        vec!["instance_id".to_string(), "id".to_string()],
    ))
}

fn reduce_renamed(event: &Event) -> Result<Statement, ReduceError> {
    Ok(Statement::update(
        event,
        TABLE,
        vec![
            Column::new("name", name_of(event)?),
            Column::new("sequence", event.sequence),
        ],
        vec![
            Condition::new("instance_id", event.instance_id.as_str()),
            Condition::new("id", event.aggregate_id.as_str()),
        ],
    ))
}

/// One aggregate type, two event types, one table.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TestProjection;

impl Projection for TestProjection {
    fn name(&self) -> &str {
        TEST_PROJECTION
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new(AGGREGATE)
                .on(ADDED, reduce_added)
                .on(RENAMED, reduce_renamed),
        ]
    }
}

pub(crate) fn new_event(instance: &str, id: &str, event_type: &str, payload: Value) -> NewEvent {
    NewEvent::new(
        InstanceId::from(instance.to_string()),
        AGGREGATE.into(),
        id.to_string().into(),
        event_type.to_string().into(),
        payload,
    )
}

pub(crate) fn added(instance: &str, id: &str, name: &str) -> NewEvent {
    new_event(instance, id, ADDED, json!({ "name": name }))
}

pub(crate) fn renamed(instance: &str, id: &str, name: &str) -> NewEvent {
    new_event(instance, id, RENAMED, json!({ "name": name }))
}

pub(crate) fn instance(id: &str) -> InstanceId {
    InstanceId::from(id.to_string())
}

/// Timings short enough for tests.
pub(crate) fn fast_config() -> ProjectionConfig {
    ProjectionConfig::default()
        .with_retry_failed_after(Duration::from_millis(5))
        .with_max_retries(2)
        .with_max_failure_count(3)
        .with_requeue_every(Duration::from_millis(50))
        .with_lock_duration(Duration::from_secs(5))
}

pub(crate) struct Fixture {
    pub source: Arc<InMemoryEventSource>,
    pub store: InMemoryProjectionStore,
    pub locks: LockTable,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            source: Arc::new(InMemoryEventSource::new()),
            store: InMemoryProjectionStore::new(),
            locks: LockTable::new(),
        }
    }

    /// Push events and return them with their assigned sequences.
    pub async fn push(&self, events: Vec<NewEvent>) -> Vec<Event> {
        self.source.push(events).await.unwrap()
    }

    /// Push events with a fixed creation date.
    pub fn push_at(&self, events: Vec<NewEvent>, at: chrono::DateTime<Utc>) -> Vec<Event> {
        self.source.push_at(events, at).unwrap()
    }

    pub fn statements(&self, max_failure_count: u32) -> StatementHandler {
        let registry = forgeiam_events::ReducerRegistry::for_projection(&TestProjection);
        StatementHandler::new(
            TEST_PROJECTION,
            Arc::new(self.store.clone()),
            self.source.clone(),
            Arc::new(registry),
            max_failure_count,
            fast_config().bulk_limit,
        )
    }

    pub fn handler(&self, config: ProjectionConfig) -> Arc<ProjectionHandler> {
        self.handler_owned_by("owner-a", config)
    }

    pub fn handler_owned_by(&self, owner: &str, config: ProjectionConfig) -> Arc<ProjectionHandler> {
        let locker = InMemoryLocker::new(self.locks.clone(), TEST_PROJECTION, owner);
        Arc::new(ProjectionHandler::new(
            &TestProjection,
            config,
            self.source.clone(),
            Arc::new(self.store.clone()),
            Arc::new(locker),
        ))
    }

    /// `(id, name)` of every projected row of `instance`, sorted by id.
    pub async fn names(&self, instance: &str) -> Vec<(String, String)> {
        let mut names: Vec<_> = self
            .store
            .rows(TABLE)
            .await
            .into_iter()
            .filter(|row| row.get("instance_id") == Some(&SqlValue::from(instance)))
            .filter_map(|row| match (row.get("id"), row.get("name")) {
                (
                    Some(SqlValue::Text(id)),
                    Some(SqlValue::Text(name)),
                ) => Some((id.clone(), name.clone())),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    pub async fn sequence(&self, instance_id: &str) -> Option<u64> {
        self.store
            .sequence(TEST_PROJECTION, &AGGREGATE.into(), &instance(instance_id))
            .await
    }
}
