use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use forgeiam_core::{AggregateType, EventType};

use crate::{Event, Statement};

/// Reducing an event into a statement failed.
///
/// Reduction errors are fatal to the call that triggered them: no statement of
/// the batch is applied.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("event {event_type} (sequence {sequence}) has an undecodable payload: {source}")]
    Payload {
        event_type: EventType,
        sequence: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("event {event_type} (sequence {sequence}) is invalid: {reason}")]
    Invalid {
        event_type: EventType,
        sequence: u64,
        reason: String,
    },
}

impl ReduceError {
    pub fn payload(event: &Event, source: serde_json::Error) -> Self {
        Self::Payload {
            event_type: event.event_type.clone(),
            sequence: event.sequence,
            source,
        }
    }

    pub fn invalid(event: &Event, reason: impl Into<String>) -> Self {
        Self::Invalid {
            event_type: event.event_type.clone(),
            sequence: event.sequence,
            reason: reason.into(),
        }
    }
}

/// Decode an event payload inside a reducer.
pub fn decode_payload<T>(event: &Event) -> Result<T, ReduceError>
where
    T: serde::de::DeserializeOwned,
{
    event
        .payload_as()
        .map_err(|source| ReduceError::payload(event, source))
}

/// Pure function mapping one event to one statement.
pub type ReduceFn = fn(&Event) -> Result<Statement, ReduceError>;

/// A reducer for one event type.
#[derive(Clone, Copy)]
pub struct EventReducer {
    pub event_type: &'static str,
    pub reduce: ReduceFn,
}

impl core::fmt::Debug for EventReducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventReducer")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// The reducers a projection registers for one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateReducer {
    pub aggregate_type: &'static str,
    pub event_reducers: Vec<EventReducer>,
}

impl AggregateReducer {
    pub fn new(aggregate_type: &'static str) -> Self {
        Self {
            aggregate_type,
            event_reducers: Vec::new(),
        }
    }

    pub fn on(mut self, event_type: &'static str, reduce: ReduceFn) -> Self {
        self.event_reducers.push(EventReducer { event_type, reduce });
        self
    }
}

/// A projection builds a relational read model from the event stream.
///
/// Implementations only describe *what* to do with each event (its reducers);
/// intake, ordering, retries and sequence bookkeeping are owned by the
/// projection handler.
///
/// Reducers must be pure: the same event always yields the same statement, so
/// redelivery and gap-filling can reduce an event any number of times.
pub trait Projection: Send + Sync {
    /// Unique projection name (also the table prefix, e.g. `projections.users`).
    fn name(&self) -> &str;

    fn reducers(&self) -> Vec<AggregateReducer>;
}

impl<P> Projection for Arc<P>
where
    P: Projection + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        (**self).reducers()
    }
}

/// Dispatch table built from a projection's reducers.
///
/// Events the projection subscribed to (by aggregate type) but has no reducer
/// for reduce to a no-op statement, so the stored sequence still advances past
/// them.
#[derive(Debug, Clone, Default)]
pub struct ReducerRegistry {
    reducers: HashMap<(String, String), ReduceFn>,
    aggregate_types: BTreeSet<AggregateType>,
    event_types: BTreeSet<EventType>,
}

impl ReducerRegistry {
    pub fn new(reducers: Vec<AggregateReducer>) -> Self {
        let mut registry = Self::default();
        for aggregate in reducers {
            registry
                .aggregate_types
                .insert(AggregateType::from(aggregate.aggregate_type));
            for event in aggregate.event_reducers {
                registry
                    .event_types
                    .insert(EventType::from(event.event_type));
                registry.reducers.insert(
                    (
                        aggregate.aggregate_type.to_string(),
                        event.event_type.to_string(),
                    ),
                    event.reduce,
                );
            }
        }
        registry
    }

    pub fn for_projection<P: Projection + ?Sized>(projection: &P) -> Self {
        Self::new(projection.reducers())
    }

    pub fn reduce(&self, event: &Event) -> Result<Statement, ReduceError> {
        let key = (
            event.aggregate_type.as_str().to_string(),
            event.event_type.as_str().to_string(),
        );
        match self.reducers.get(&key) {
            Some(reduce) => reduce(event),
            None => {
                debug!(
                    aggregate_type = %event.aggregate_type,
                    event_type = %event.event_type,
                    sequence = event.sequence,
                    "no reducer for event, reducing to no-op"
                );
                Ok(Statement::noop(event))
            }
        }
    }

    /// Reduce every event, failing on the first error.
    pub fn reduce_all(&self, events: &[Event]) -> Result<Vec<Statement>, ReduceError> {
        events
            .iter()
            .map(|event| self.reduce(event))
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|err| warn!(events = events.len(), error = %err, "batch reduction failed"))
    }

    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        self.aggregate_types.iter().cloned().collect()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.event_types.iter().cloned().collect()
    }

    pub fn handles(&self, aggregate_type: &AggregateType) -> bool {
        self.aggregate_types.contains(aggregate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Column, OperationKind};
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &'static str) -> Event {
        Event {
            aggregate_type: "user".into(),
            aggregate_id: "u1".into(),
            instance_id: "acme".into(),
            event_type: event_type.into(),
            sequence: 3,
            previous_aggregate_sequence: 2,
            previous_aggregate_type_sequence: 2,
            creation_date: Utc::now(),
            payload: json!({ "name": "ada" }),
        }
    }

    fn reduce_added(event: &Event) -> Result<Statement, ReduceError> {
        let name = event
            .payload
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ReduceError::invalid(event, "missing name"))?;
        Ok(Statement::create(
            event,
            "users",
            vec![Column::new("name", name)],
        ))
    }

    fn registry() -> ReducerRegistry {
        ReducerRegistry::new(vec![
            AggregateReducer::new("user").on("user.added", reduce_added),
        ])
    }

    #[test]
    fn dispatches_on_aggregate_and_event_type() {
        let stmt = registry().reduce(&event("user.added")).unwrap();
        assert_eq!(stmt.kind(), OperationKind::Create);
    }

    #[test]
    fn unknown_event_reduces_to_noop() {
        let stmt = registry().reduce(&event("user.renamed")).unwrap();
        assert_eq!(stmt.kind(), OperationKind::NoOp);
        assert_eq!(stmt.sequence, 3);
    }

    #[test]
    fn reduce_all_fails_fast() {
        let mut bad = event("user.added");
        bad.payload = json!({});
        let err = registry()
            .reduce_all(&[event("user.added"), bad])
            .unwrap_err();
        assert!(matches!(err, ReduceError::Invalid { .. }));
    }

    #[test]
    fn exposes_query_types() {
        let registry = registry();
        assert_eq!(registry.aggregate_types(), vec![AggregateType::from("user")]);
        assert_eq!(registry.event_types(), vec![EventType::from("user.added")]);
        assert!(registry.handles(&AggregateType::from("user")));
    }
}
