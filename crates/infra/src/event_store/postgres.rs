//! Postgres-backed event source.
//!
//! ## Error Mapping
//!
//! | SQLx Error | EventStoreError |
//! |------------|-----------------|
//! | Database (check/foreign key violation) | `InvalidPush` |
//! | Database (other), PoolClosed, other | `Storage` |
//!
//! ## Ordering
//!
//! Pushes serialize on a transaction-scoped advisory lock, so sequences are
//! committed in the order they are assigned and a reader never observes a
//! sequence before all lower ones are visible.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tracing::{Span, instrument};

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, InstanceQuery, NewEvent, QueryClause, SearchQuery};

use super::r#trait::{EventSource, EventStoreError};

/// Advisory lock key serializing pushes.
const PUSH_LOCK_KEY: i64 = 0x6576_656e_7473;

/// Postgres-backed event source over the `events` table.
#[derive(Debug, Clone)]
pub struct PostgresEventSource {
    pool: Arc<PgPool>,
}

impl PostgresEventSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl EventSource for PostgresEventSource {
    #[instrument(skip(self, query), fields(clauses = query.clauses.len(), limit = ?query.limit, event_count = tracing::field::Empty), err)]
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        if query.clauses.is_empty() {
            return Ok(vec![]);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT sequence, instance_id, aggregate_type, aggregate_id, event_type, \
             previous_aggregate_sequence, previous_aggregate_type_sequence, creation_date, \
             payload FROM events WHERE ",
        );
        for (idx, clause) in query.clauses.iter().enumerate() {
            if idx > 0 {
                qb.push(" OR ");
            }
            push_clause(&mut qb, clause);
        }
        qb.push(" ORDER BY sequence ASC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let row = EventRow::from_row(&row).map_err(|e| {
                EventStoreError::Storage(format!("failed to deserialize event row: {e}"))
            })?;
            events.push(row.into());
        }

        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn push(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PUSH_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("push_lock", e))?;

        let mut committed = Vec::with_capacity(events.len());
        for new in events {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    instance_id,
                    aggregate_type,
                    aggregate_id,
                    event_type,
                    previous_aggregate_sequence,
                    previous_aggregate_type_sequence,
                    payload
                )
                VALUES (
                    $1, $2, $3, $4,
                    COALESCE((
                        SELECT MAX(sequence) FROM events
                        WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
                    ), 0),
                    COALESCE((
                        SELECT MAX(sequence) FROM events
                        WHERE instance_id = $1 AND aggregate_type = $2
                    ), 0),
                    $5
                )
                RETURNING
                    sequence,
                    previous_aggregate_sequence,
                    previous_aggregate_type_sequence,
                    creation_date
                "#,
            )
            .bind(new.instance_id.as_str())
            .bind(new.aggregate_type.as_str())
            .bind(new.aggregate_id.as_str())
            .bind(new.event_type.as_str())
            .bind(&new.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            let read = |col: &str, e: sqlx::Error| {
                EventStoreError::Storage(format!("failed to read {col}: {e}"))
            };
            let sequence: i64 = row.try_get("sequence").map_err(|e| read("sequence", e))?;
            let previous_aggregate_sequence: i64 = row
                .try_get("previous_aggregate_sequence")
                .map_err(|e| read("previous_aggregate_sequence", e))?;
            let previous_aggregate_type_sequence: i64 = row
                .try_get("previous_aggregate_type_sequence")
                .map_err(|e| read("previous_aggregate_type_sequence", e))?;
            let creation_date: DateTime<Utc> = row
                .try_get("creation_date")
                .map_err(|e| read("creation_date", e))?;

            committed.push(Event {
                aggregate_type: new.aggregate_type,
                aggregate_id: new.aggregate_id,
                instance_id: new.instance_id,
                event_type: new.event_type,
                sequence: sequence as u64,
                previous_aggregate_sequence: previous_aggregate_sequence as u64,
                previous_aggregate_type_sequence: previous_aggregate_type_sequence as u64,
                creation_date,
                payload: new.payload,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }

    #[instrument(skip(self), err)]
    async fn instance_ids(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<InstanceId>, EventStoreError> {
        let excluded: Vec<String> = query
            .excluded
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT instance_id
            FROM events
            WHERE ($1::timestamptz IS NULL OR creation_date > $1)
                AND NOT (instance_id = ANY($2))
            ORDER BY instance_id
            "#,
        )
        .bind(query.created_after)
        .bind(&excluded)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("instance_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("instance_id")
                    .map(InstanceId::from)
                    .map_err(|e| EventStoreError::Storage(format!("failed to read instance_id: {e}")))
            })
            .collect()
    }
}

fn push_clause(qb: &mut QueryBuilder<'_, Postgres>, clause: &QueryClause) {
    qb.push("(TRUE");
    if let Some(id) = &clause.instance_id {
        qb.push(" AND instance_id = ")
            .push_bind(id.as_str().to_string());
    }
    if !clause.excluded_instance_ids.is_empty() {
        let ids: Vec<String> = clause
            .excluded_instance_ids
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        qb.push(" AND NOT (instance_id = ANY(").push_bind(ids).push("))");
    }
    if !clause.aggregate_types.is_empty() {
        let types: Vec<String> = clause
            .aggregate_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        qb.push(" AND aggregate_type = ANY(").push_bind(types).push(")");
    }
    if !clause.aggregate_ids.is_empty() {
        let ids: Vec<String> = clause
            .aggregate_ids
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        qb.push(" AND aggregate_id = ANY(").push_bind(ids).push(")");
    }
    if !clause.event_types.is_empty() {
        let types: Vec<String> = clause
            .event_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        qb.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
    if let Some(seq) = clause.sequence_greater {
        qb.push(" AND sequence > ").push_bind(seq as i64);
    }
    if let Some(seq) = clause.sequence_less {
        qb.push(" AND sequence < ").push_bind(seq as i64);
    }
    if let Some(at) = clause.created_after {
        qb.push(" AND creation_date > ").push_bind(at);
    }
    if let Some(at) = clause.created_until {
        qb.push(" AND creation_date <= ").push_bind(at);
    }
    qb.push(")");
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // check / foreign key violation
                Some("23514") | Some("23503") => EventStoreError::InvalidPush(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    sequence: i64,
    instance_id: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    previous_aggregate_sequence: i64,
    previous_aggregate_type_sequence: i64,
    creation_date: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            sequence: row.try_get("sequence")?,
            instance_id: row.try_get("instance_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            previous_aggregate_sequence: row.try_get("previous_aggregate_sequence")?,
            previous_aggregate_type_sequence: row.try_get("previous_aggregate_type_sequence")?,
            creation_date: row.try_get("creation_date")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            aggregate_type: row.aggregate_type.into(),
            aggregate_id: row.aggregate_id.into(),
            instance_id: row.instance_id.into(),
            event_type: row.event_type.into(),
            sequence: row.sequence as u64,
            previous_aggregate_sequence: row.previous_aggregate_sequence as u64,
            previous_aggregate_type_sequence: row.previous_aggregate_type_sequence as u64,
            creation_date: row.creation_date,
            payload: row.payload,
        }
    }
}
