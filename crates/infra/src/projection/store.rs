//! Storage seam of the statement handler.
//!
//! A [`ProjectionStore`] opens [`ProjectionTx`]s. One transaction covers one
//! `update` call: sequence rows are read with a row lock, every statement runs
//! in its own savepoint, and failures are counted in the same transaction.

use std::sync::Arc;

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::{Operation, Statement};

use super::error::StorageError;
use super::sequence::{CurrentSequence, SequenceKey};

#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ProjectionTx>, StorageError>;

    /// Current sequences of `projection` for `instances`, without row locks.
    async fn current_sequences(
        &self,
        projection: &str,
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError>;

    /// Failure count of one event (`0` if it never failed).
    async fn failure_count(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
    ) -> Result<u32, StorageError>;
}

#[async_trait::async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn ProjectionTx>, StorageError> {
        (**self).begin().await
    }

    async fn current_sequences(
        &self,
        projection: &str,
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError> {
        (**self).current_sequences(projection, instances).await
    }

    async fn failure_count(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
    ) -> Result<u32, StorageError> {
        (**self).failure_count(projection, instance_id, sequence).await
    }
}

/// One open projection transaction.
#[async_trait::async_trait]
pub trait ProjectionTx: Send {
    /// Read the current sequences and lock their rows until commit.
    async fn lock_sequences(
        &mut self,
        projection: &str,
        aggregate_types: &[AggregateType],
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError>;

    async fn savepoint(&mut self) -> Result<(), StorageError>;

    async fn rollback_to_savepoint(&mut self) -> Result<(), StorageError>;

    async fn release_savepoint(&mut self) -> Result<(), StorageError>;

    /// Execute one single-table operation (create, update or delete).
    async fn execute(&mut self, operation: &Operation) -> Result<(), StorageError>;

    /// Raise a sequence row; returns the number of rows written. `0` means the
    /// stored sequence was already at or above `sequence`, i.e. another
    /// transaction applied the same events first.
    async fn upsert_sequence(
        &mut self,
        projection: &str,
        key: &SequenceKey,
        sequence: u64,
    ) -> Result<u64, StorageError>;

    /// Count one more failure of `statement`'s event; returns the new count.
    async fn record_failure(
        &mut self,
        projection: &str,
        statement: &Statement,
        error: &str,
    ) -> Result<u32, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
