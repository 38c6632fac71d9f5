use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgeiam_core::{AggregateId, AggregateType, EventType, InstanceId};

/// An event as read back from the event store.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **totally ordered** within an aggregate by `sequence`
/// - **instance-scoped** (every event belongs to exactly one tenant)
///
/// `sequence` is assigned by the event store on push and strictly increases.
/// Two back-references let consumers detect gaps:
/// - `previous_aggregate_sequence`: the preceding event of the same aggregate
/// - `previous_aggregate_type_sequence`: the preceding event of the same
///   aggregate type within the same instance
///
/// Both are `0` when there is no predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub instance_id: InstanceId,
    pub event_type: EventType,

    pub sequence: u64,
    pub previous_aggregate_sequence: u64,
    pub previous_aggregate_type_sequence: u64,

    pub creation_date: DateTime<Utc>,
    pub payload: JsonValue,
}

impl Event {
    /// Decode the payload into a typed event body.
    pub fn payload_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.payload.clone())
    }
}

/// An event ready to be pushed (not yet assigned a sequence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub instance_id: InstanceId,
    pub event_type: EventType,
    pub payload: JsonValue,
}

impl NewEvent {
    pub fn new(
        instance_id: InstanceId,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        event_type: EventType,
        payload: JsonValue,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            instance_id,
            event_type,
            payload,
        }
    }

    /// Build a typed payload event.
    pub fn from_typed<T: Serialize>(
        instance_id: InstanceId,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        event_type: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            instance_id,
            aggregate_type,
            aggregate_id,
            event_type,
            serde_json::to_value(payload)?,
        ))
    }
}
