//! Postgres projection storage.
//!
//! Statements are rendered with `QueryBuilder`; table and column names come
//! from reducers and are checked to be plain (optionally schema-qualified)
//! identifiers before they are spliced into SQL.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::instrument;

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::{Column, Condition, Operation, SqlValue, Statement};

use super::error::StorageError;
use super::sequence::{CurrentSequence, SequenceKey};
use super::store::{ProjectionStore, ProjectionTx};

const SAVEPOINT: &str = "exec_stmt";

#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => StorageError::database(
            operation,
            format!(
                "{} (code {})",
                db_err.message(),
                db_err.code().as_deref().unwrap_or("none")
            ),
        ),
        other => StorageError::database(operation, other.to_string()),
    }
}

fn strings<T: AsRef<str>>(values: &[T]) -> Vec<String> {
    values.iter().map(|v| v.as_ref().to_string()).collect()
}

fn sequence_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<CurrentSequence>, StorageError> {
    rows.iter()
        .map(|row| {
            let aggregate_type: String = row.try_get("aggregate_type").map_err(|e| map_sqlx_error("read_sequence", e))?;
            let instance_id: String = row.try_get("instance_id").map_err(|e| map_sqlx_error("read_sequence", e))?;
            let sequence: i64 = row.try_get("current_sequence").map_err(|e| map_sqlx_error("read_sequence", e))?;
            Ok(CurrentSequence {
                aggregate_type: aggregate_type.into(),
                instance_id: instance_id.into(),
                sequence: sequence as u64,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl ProjectionStore for PostgresProjectionStore {
    async fn begin(&self) -> Result<Box<dyn ProjectionTx>, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresProjectionTx { tx }))
    }

    #[instrument(skip(self), err)]
    async fn current_sequences(
        &self,
        projection: &str,
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_type, instance_id, current_sequence
            FROM projections.current_sequences
            WHERE projection_name = $1 AND instance_id = ANY($2)
            "#,
        )
        .bind(projection)
        .bind(strings(instances))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_sequences", e))?;

        sequence_rows(rows)
    }

    async fn failure_count(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
    ) -> Result<u32, StorageError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT failure_count
            FROM projections.failed_events
            WHERE projection_name = $1 AND instance_id = $2 AND failed_sequence = $3
            "#,
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(sequence as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("failure_count", e))?;

        Ok(count.unwrap_or(0) as u32)
    }
}

pub struct PostgresProjectionTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresProjectionTx {
    async fn raw(&mut self, operation: &'static str, sql: &str) -> Result<(), StorageError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectionTx for PostgresProjectionTx {
    async fn lock_sequences(
        &mut self,
        projection: &str,
        aggregate_types: &[AggregateType],
        instances: &[InstanceId],
    ) -> Result<Vec<CurrentSequence>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_type, instance_id, current_sequence
            FROM projections.current_sequences
            WHERE projection_name = $1
                AND aggregate_type = ANY($2)
                AND instance_id = ANY($3)
            FOR UPDATE
            "#,
        )
        .bind(projection)
        .bind(strings(aggregate_types))
        .bind(strings(instances))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_sequences", e))?;

        sequence_rows(rows)
    }

    async fn savepoint(&mut self) -> Result<(), StorageError> {
        self.raw("savepoint", &format!("SAVEPOINT {SAVEPOINT}")).await
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StorageError> {
        self.raw("rollback_to_savepoint", &format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"))
            .await
    }

    async fn release_savepoint(&mut self) -> Result<(), StorageError> {
        self.raw("release_savepoint", &format!("RELEASE SAVEPOINT {SAVEPOINT}"))
            .await
    }

    async fn execute(&mut self, operation: &Operation) -> Result<(), StorageError> {
        operation.validate()?;
        match operation {
            Operation::NoOp => Ok(()),
            Operation::Multi(operations) => {
                for operation in operations {
                    self.execute(operation).await?;
                }
                Ok(())
            }
            single => {
                let mut qb = render(single)?;
                qb.build()
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("execute_statement", e))?;
                Ok(())
            }
        }
    }

    async fn upsert_sequence(
        &mut self,
        projection: &str,
        key: &SequenceKey,
        sequence: u64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO projections.current_sequences AS cs (
                projection_name,
                aggregate_type,
                instance_id,
                current_sequence,
                updated_at
            )
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (projection_name, aggregate_type, instance_id) DO UPDATE
            SET current_sequence = EXCLUDED.current_sequence,
                updated_at = EXCLUDED.updated_at
            WHERE cs.current_sequence < EXCLUDED.current_sequence
            "#,
        )
        .bind(projection)
        .bind(key.aggregate_type.as_str())
        .bind(key.instance_id.as_str())
        .bind(sequence as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_sequence", e))?;

        Ok(result.rows_affected())
    }

    async fn record_failure(
        &mut self,
        projection: &str,
        statement: &Statement,
        error: &str,
    ) -> Result<u32, StorageError> {
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO projections.failed_events AS fe (
                projection_name,
                instance_id,
                failed_sequence,
                failure_count,
                error,
                last_failed
            )
            VALUES ($1, $2, $3, 1, $4, NOW())
            ON CONFLICT (projection_name, instance_id, failed_sequence) DO UPDATE
            SET failure_count = fe.failure_count + 1,
                error = EXCLUDED.error,
                last_failed = EXCLUDED.last_failed
            RETURNING failure_count
            "#,
        )
        .bind(projection)
        .bind(statement.instance_id.as_str())
        .bind(statement.sequence as i64)
        .bind(error)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        Ok(count as u32)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Plain or schema-qualified SQL identifier.
fn ident(name: &str) -> Result<&str, StorageError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            part.chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            qb.push("NULL");
        }
        SqlValue::Bool(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Int(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Float(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Text(v) => {
            qb.push_bind(v.clone());
        }
        SqlValue::Timestamp(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Json(v) => {
            qb.push_bind(v.clone());
        }
        SqlValue::TextArray(v) => {
            qb.push_bind(v.clone());
        }
    }
}

fn push_conditions(
    qb: &mut QueryBuilder<'static, Postgres>,
    conditions: &[Condition],
) -> Result<(), StorageError> {
    qb.push(" WHERE ");
    for (idx, condition) in conditions.iter().enumerate() {
        if idx > 0 {
            qb.push(" AND ");
        }
        qb.push(ident(&condition.column)?);
        if condition.value == SqlValue::Null {
            qb.push(" IS NULL");
        } else {
            qb.push(" = ");
            push_value(qb, &condition.value);
        }
    }
    Ok(())
}

fn push_assignments(
    qb: &mut QueryBuilder<'static, Postgres>,
    columns: &[Column],
) -> Result<(), StorageError> {
    for (idx, column) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        qb.push(ident(&column.name)?).push(" = ");
        push_value(qb, &column.value);
    }
    Ok(())
}

/// Render a single-table operation.
fn render(operation: &Operation) -> Result<QueryBuilder<'static, Postgres>, StorageError> {
    let mut qb = QueryBuilder::new("");
    match operation {
        Operation::Create {
            table,
            columns,
            conflict,
        } => {
            qb.push("INSERT INTO ").push(ident(table)?).push(" (");
            for (idx, column) in columns.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                qb.push(ident(&column.name)?);
            }
            qb.push(") VALUES (");
            for (idx, column) in columns.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                push_value(&mut qb, &column.value);
            }
            qb.push(")");

            if !conflict.is_empty() {
                qb.push(" ON CONFLICT (");
                for (idx, key) in conflict.iter().enumerate() {
                    if idx > 0 {
                        qb.push(", ");
                    }
                    qb.push(ident(key)?);
                }
                qb.push(") DO UPDATE SET ");
                let updates: Vec<&Column> = columns
                    .iter()
                    .filter(|c| !conflict.contains(&c.name))
                    .collect();
                if updates.is_empty() {
                    // nothing but keys: keep the row
                    let key = ident(&conflict[0])?;
                    qb.push(key).push(" = EXCLUDED.").push(key);
                }
                for (idx, column) in updates.iter().enumerate() {
                    if idx > 0 {
                        qb.push(", ");
                    }
                    let name = ident(&column.name)?;
                    qb.push(name).push(" = EXCLUDED.").push(name);
                }
            }
        }
        Operation::Update {
            table,
            columns,
            conditions,
        } => {
            qb.push("UPDATE ").push(ident(table)?).push(" SET ");
            push_assignments(&mut qb, columns)?;
            push_conditions(&mut qb, conditions)?;
        }
        Operation::Delete { table, conditions } => {
            qb.push("DELETE FROM ").push(ident(table)?);
            push_conditions(&mut qb, conditions)?;
        }
        Operation::NoOp | Operation::Multi(_) => {}
    }
    Ok(qb)
}
