use thiserror::Error;

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::{OperationError, ReduceError};

use crate::event_store::EventStoreError;
use crate::lock::LockError;

/// Projection storage failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    #[error(transparent)]
    InvalidOperation(#[from] OperationError),

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// Raised by in-memory fault injection.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StorageError {
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Projection handler error.
///
/// Every variant except [`HandlerError::SomeStatementsFailed`] means the call
/// made no progress: its transaction was rolled back.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("reduce failed: {0}")]
    Reduce(#[from] ReduceError),

    #[error("transaction {operation} failed: {source}")]
    Transaction {
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("sequence update for {aggregate_type} in instance {instance_id} affected no rows")]
    SequenceUpdate {
        aggregate_type: AggregateType,
        instance_id: InstanceId,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("projection storage failed: {0}")]
    Storage(#[from] StorageError),

    /// Statements after `last_applied` (an index into the caller's slice) were
    /// not applied. `None` when nothing was applied.
    #[error("some statements failed (last applied index: {last_applied:?})")]
    SomeStatementsFailed { last_applied: Option<usize> },

    #[error("cancelled")]
    Cancelled,

    #[error("no instance to process")]
    NoInstance,
}

impl HandlerError {
    pub(crate) fn transaction(operation: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| Self::Transaction { operation, source }
    }
}
