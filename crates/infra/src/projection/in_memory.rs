//! In-memory projection storage.
//!
//! Tables are lists of rows (column name → value). A transaction holds the
//! store's mutex for its whole lifetime, which serializes transactions the way
//! the row locks on the sequence table do in Postgres. Writes go to a working
//! copy; savepoints are snapshots of that copy.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::{Column, Condition, Operation, SqlValue, Statement};

use super::error::StorageError;
use super::sequence::{CurrentSequence, SequenceKey};
use super::store::{ProjectionStore, ProjectionTx};

pub type Row = BTreeMap<String, SqlValue>;

/// A counted event failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEvent {
    pub count: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<String, Vec<Row>>,
    sequences: BTreeMap<(String, SequenceKey), u64>,
    failures: BTreeMap<(String, InstanceId, u64), FailedEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    /// (table, column, value): operations touching this value fail.
    values: Vec<(String, String, SqlValue)>,
    reject_sequence_updates: bool,
    /// Operations executed, in order.
    executed: Vec<Operation>,
    begins: usize,
}

/// In-memory [`ProjectionStore`] for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionStore {
    state: Arc<Mutex<State>>,
    faults: Arc<StdMutex<Faults>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `table` that writes or matches
    /// `column = value` fail.
    pub fn fail_on(&self, table: &str, column: &str, value: impl Into<SqlValue>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults
                .values
                .push((table.to_string(), column.to_string(), value.into()));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.values.clear();
            faults.reject_sequence_updates = false;
        }
    }

    /// Make sequence upserts report zero affected rows.
    pub fn reject_sequence_updates(&self, reject: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.reject_sequence_updates = reject;
        }
    }

    /// Operations executed so far (including rolled back ones).
    pub fn executed(&self) -> Vec<Operation> {
        self.faults
            .lock()
            .map(|f| f.executed.clone())
            .unwrap_or_default()
    }

    /// Transactions opened so far.
    pub fn transactions(&self) -> usize {
        self.faults.lock().map(|f| f.begins).unwrap_or(0)
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn sequence(
        &self,
        projection: &str,
        aggregate_type: &AggregateType,
        instance_id: &InstanceId,
    ) -> Option<u64> {
        let key = SequenceKey::new(aggregate_type.clone(), instance_id.clone());
        self.state
            .lock()
            .await
            .sequences
            .get(&(projection.to_string(), key))
            .copied()
    }

    pub async fn failed_event(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
    ) -> Option<FailedEvent> {
        self.state
            .lock()
            .await
            .failures
            .get(&(projection.to_string(), instance_id.clone(), sequence))
            .cloned()
    }
}

#[async_trait::async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn begin(&self) -> Result<Box<dyn ProjectionTx>, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        if let Ok(mut faults) = self.faults.lock() {
            faults.begins += 1;
        }
        let working = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            savepoints: Vec::new(),
            faults: self.faults.clone(),
        }))
    }

    async fn current_sequences(
        &self,
        projection: &str,
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError> {
        let state = self.state.lock().await;
        Ok(read_sequences(&state, projection, None, instances))
    }

    async fn failure_count(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
    ) -> Result<u32, StorageError> {
        Ok(self
            .failed_event(projection, instance_id, sequence)
            .await
            .map_or(0, |f| f.count))
    }
}

fn read_sequences(
    state: &State,
    projection: &str,
    aggregate_types: Option<&[AggregateType]>,
    instances: &[InstanceId],
) -> Vec<CurrentSequence> {
    state
        .sequences
        .iter()
        .filter(|((name, key), _)| {
            name == projection
                && instances.contains(&key.instance_id)
                && aggregate_types.is_none_or(|types| types.contains(&key.aggregate_type))
        })
        .map(|((_, key), sequence)| CurrentSequence {
            aggregate_type: key.aggregate_type.clone(),
            instance_id: key.instance_id.clone(),
            sequence: *sequence,
        })
        .collect()
}

struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    savepoints: Vec<State>,
    faults: Arc<StdMutex<Faults>>,
}

impl InMemoryTx {
    fn check_faults(&self, table: &str, values: &[(&str, &SqlValue)]) -> Result<(), StorageError> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| StorageError::database("execute", "fault table poisoned"))?;
        for (t, column, value) in &faults.values {
            if t == table && values.iter().any(|(c, v)| *c == column.as_str() && *v == value) {
                return Err(StorageError::Injected(format!("{table}.{column} = {value:?}")));
            }
        }
        Ok(())
    }
}

fn row_matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|c| row.get(&c.column).unwrap_or(&SqlValue::Null) == &c.value)
}

fn assign(row: &mut Row, columns: &[Column]) {
    for column in columns {
        row.insert(column.name.clone(), column.value.clone());
    }
}

#[async_trait::async_trait]
impl ProjectionTx for InMemoryTx {
    async fn lock_sequences(
        &mut self,
        projection: &str,
        aggregate_types: &[AggregateType],
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError> {
        Ok(read_sequences(
            &self.working,
            projection,
            Some(aggregate_types),
            instances,
        ))
    }

    async fn savepoint(&mut self) -> Result<(), StorageError> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StorageError> {
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| StorageError::database("rollback_to_savepoint", "no savepoint"))?;
        self.working = snapshot;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StorageError> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| StorageError::database("release_savepoint", "no savepoint"))
    }

    async fn execute(&mut self, operation: &Operation) -> Result<(), StorageError> {
        if let Ok(mut faults) = self.faults.lock() {
            faults.executed.push(operation.clone());
        }
        operation.validate()?;

        match operation {
            Operation::Create {
                table,
                columns,
                conflict,
            } => {
                let values: Vec<_> = columns.iter().map(|c| (c.name.as_str(), &c.value)).collect();
                self.check_faults(table, &values)?;

                let rows = self.working.tables.entry(table.clone()).or_default();
                let existing = if conflict.is_empty() {
                    None
                } else {
                    rows.iter_mut().find(|row| {
                        conflict.iter().all(|key| {
                            columns
                                .iter()
                                .find(|c| &c.name == key)
                                .is_some_and(|c| row.get(key) == Some(&c.value))
                        })
                    })
                };
                match existing {
                    Some(row) => assign(row, columns),
                    None => {
                        let mut row = Row::new();
                        assign(&mut row, columns);
                        rows.push(row);
                    }
                }
            }
            Operation::Update {
                table,
                columns,
                conditions,
            } => {
                let mut values: Vec<_> = columns.iter().map(|c| (c.name.as_str(), &c.value)).collect();
                values.extend(conditions.iter().map(|c| (c.column.as_str(), &c.value)));
                self.check_faults(table, &values)?;

                if let Some(rows) = self.working.tables.get_mut(table) {
                    for row in rows.iter_mut().filter(|row| row_matches(row, conditions)) {
                        assign(row, columns);
                    }
                }
            }
            Operation::Delete { table, conditions } => {
                let values: Vec<_> = conditions.iter().map(|c| (c.column.as_str(), &c.value)).collect();
                self.check_faults(table, &values)?;

                if let Some(rows) = self.working.tables.get_mut(table) {
                    rows.retain(|row| !row_matches(row, conditions));
                }
            }
            Operation::NoOp => {}
            Operation::Multi(operations) => {
                for operation in operations {
                    self.execute(operation).await?;
                }
            }
        }
        Ok(())
    }

    async fn upsert_sequence(
        &mut self,
        projection: &str,
        key: &SequenceKey,
        sequence: u64,
    ) -> Result<u64, StorageError> {
        let reject = self
            .faults
            .lock()
            .map(|f| f.reject_sequence_updates)
            .unwrap_or(false);
        if reject {
            return Ok(0);
        }

        let slot = (projection.to_string(), key.clone());
        if self.working.sequences.get(&slot).is_some_and(|current| *current >= sequence) {
            return Ok(0);
        }
        self.working.sequences.insert(slot, sequence);
        Ok(1)
    }

    async fn record_failure(
        &mut self,
        projection: &str,
        statement: &Statement,
        error: &str,
    ) -> Result<u32, StorageError> {
        let entry = self
            .working
            .failures
            .entry((
                projection.to_string(),
                statement.instance_id.clone(),
                statement.sequence,
            ))
            .or_insert(FailedEvent {
                count: 0,
                error: String::new(),
            });
        entry.count += 1;
        entry.error = error.to_string();
        Ok(entry.count)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let InMemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
