//! Statements: the unit of work produced by reducing one event.
//!
//! A statement carries the identity of the event it was reduced from (aggregate
//! type, instance, sequence, previous sequence) and one SQL operation. The
//! statement handler uses the identity for sequence bookkeeping and executes
//! the operation inside its own savepoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgeiam_core::{AggregateId, AggregateType, InstanceId};

use crate::Event;

/// A bindable SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
    TextArray(Vec<String>),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A column assignment (`name = value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: SqlValue,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An equality predicate (`column = value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub value: SqlValue,
}

impl Condition {
    pub fn new(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Tag of an [`Operation`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    NoOp,
    Multi,
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no_op",
            Self::Multi => "multi",
        };
        f.write_str(s)
    }
}

/// The SQL side of a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "snake_case")]
pub enum Operation {
    /// Insert a row. A non-empty `conflict` turns the insert into an upsert on
    /// those columns (the row's uniqueness constraint).
    Create {
        table: String,
        columns: Vec<Column>,
        conflict: Vec<String>,
    },
    /// Update every row matching all `conditions`.
    Update {
        table: String,
        columns: Vec<Column>,
        conditions: Vec<Condition>,
    },
    /// Delete every row matching all `conditions`.
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
    /// Nothing to execute; only the sequence advances.
    NoOp,
    /// Several operations sharing one savepoint.
    Multi(Vec<Operation>),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete { .. } => OperationKind::Delete,
            Self::NoOp => OperationKind::NoOp,
            Self::Multi(_) => OperationKind::Multi,
        }
    }

    /// Table touched by a single-table operation.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Create { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                Some(table)
            }
            Self::NoOp | Self::Multi(_) => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        match self {
            Self::NoOp => true,
            Self::Multi(ops) => ops.iter().all(Operation::is_noop),
            _ => false,
        }
    }

    /// Reject operations that can never execute.
    ///
    /// Updates and deletes without conditions would rewrite a whole table, and
    /// statements without columns have nothing to write.
    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            Self::Create { table, columns, .. } => {
                if columns.is_empty() {
                    return Err(OperationError::NoValues(table.clone()));
                }
            }
            Self::Update {
                table,
                columns,
                conditions,
            } => {
                if columns.is_empty() {
                    return Err(OperationError::NoValues(table.clone()));
                }
                if conditions.is_empty() {
                    return Err(OperationError::NoConditions(table.clone()));
                }
            }
            Self::Delete { table, conditions } => {
                if conditions.is_empty() {
                    return Err(OperationError::NoConditions(table.clone()));
                }
            }
            Self::NoOp => {}
            Self::Multi(ops) => {
                for op in ops {
                    op.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// An operation that can never be executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("no values given for table {0}")]
    NoValues(String),

    #[error("no conditions given for table {0}")]
    NoConditions(String),
}

/// The unit of work produced by reducing one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub instance_id: InstanceId,
    pub sequence: u64,
    /// Sequence of the preceding event of the same aggregate type within the
    /// instance (`0` if unknown or none).
    pub previous_sequence: u64,
    pub creation_date: DateTime<Utc>,
    pub operation: Operation,
}

impl Statement {
    /// Build a statement for `event` with an explicit operation.
    pub fn for_event(event: &Event, operation: Operation) -> Self {
        Self {
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            instance_id: event.instance_id.clone(),
            sequence: event.sequence,
            previous_sequence: event.previous_aggregate_type_sequence,
            creation_date: event.creation_date,
            operation,
        }
    }

    pub fn create(event: &Event, table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self::for_event(
            event,
            Operation::Create {
                table: table.into(),
                columns,
                conflict: Vec::new(),
            },
        )
    }

    /// Create-or-replace on the `conflict` columns.
    pub fn upsert(
        event: &Event,
        table: impl Into<String>,
        columns: Vec<Column>,
        conflict: Vec<String>,
    ) -> Self {
        Self::for_event(
            event,
            Operation::Create {
                table: table.into(),
                columns,
                conflict,
            },
        )
    }

    pub fn update(
        event: &Event,
        table: impl Into<String>,
        columns: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self::for_event(
            event,
            Operation::Update {
                table: table.into(),
                columns,
                conditions,
            },
        )
    }

    pub fn delete(event: &Event, table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self::for_event(
            event,
            Operation::Delete {
                table: table.into(),
                conditions,
            },
        )
    }

    pub fn noop(event: &Event) -> Self {
        Self::for_event(event, Operation::NoOp)
    }

    pub fn multi(event: &Event, operations: Vec<Operation>) -> Self {
        Self::for_event(event, Operation::Multi(operations))
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}
