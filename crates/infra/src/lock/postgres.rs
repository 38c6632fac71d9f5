//! Postgres lease table.
//!
//! One row per `(projection_name, instance_id)`. A lease is taken with an
//! upsert that only overwrites rows owned by the caller or already expired;
//! acquisition succeeds only when every requested row was written.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::instrument;

use forgeiam_core::InstanceId;

use super::{Lease, LockError, LockSession, Locker};

#[derive(Debug, Clone)]
pub struct PostgresLocker {
    pool: Arc<PgPool>,
    projection: String,
    owner: String,
}

impl PostgresLocker {
    pub fn new(pool: PgPool, projection: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            projection: projection.into(),
            owner: owner.into(),
        }
    }
}

fn keys(instances: &[InstanceId]) -> Vec<String> {
    instances.iter().map(|id| id.as_str().to_string()).collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Storage(format!("sqlx error in {operation}: {err}"))
}

#[async_trait::async_trait]
impl Lease for PostgresLocker {
    fn projection(&self) -> &str {
        &self.projection
    }

    #[instrument(skip(self), fields(projection = %self.projection, owner = %self.owner), err)]
    async fn try_acquire(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<(), LockError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO projections.locks AS l (projection_name, instance_id, locker_id, locked_until)
            SELECT $1, instance_id, $2, NOW() + ($3 * INTERVAL '1 millisecond')
            FROM UNNEST($4::text[]) AS instance_id
            ON CONFLICT (projection_name, instance_id) DO UPDATE
            SET locker_id = EXCLUDED.locker_id,
                locked_until = EXCLUDED.locked_until
            WHERE l.locker_id = EXCLUDED.locker_id
                OR l.locked_until < NOW()
            "#,
        )
        .bind(&self.projection)
        .bind(&self.owner)
        .bind(duration.as_millis() as i64)
        .bind(keys(instances))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("acquire_lock", e))?;

        if result.rows_affected() != instances.len() as u64 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LockError::AlreadyLocked {
                projection: self.projection.clone(),
                instances: instances.to_vec(),
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Locker for PostgresLocker {
    async fn lock(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<LockSession, LockError> {
        LockSession::start(self.clone(), duration, instances).await
    }

    #[instrument(skip(self), fields(projection = %self.projection, owner = %self.owner), err)]
    async fn unlock(&self, instances: &[InstanceId]) -> Result<(), LockError> {
        sqlx::query(
            r#"
            DELETE FROM projections.locks
            WHERE projection_name = $1 AND locker_id = $2 AND instance_id = ANY($3)
            "#,
        )
        .bind(&self.projection)
        .bind(&self.owner)
        .bind(keys(instances))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock", e))?;
        Ok(())
    }
}
