use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use forgeiam_core::InstanceId;

use super::{Lease, LockError, LockSession, Locker};

#[derive(Debug, Clone)]
struct Holder {
    owner: String,
    until: Instant,
}

/// Shared lock table. Lockers created from the same table contend with each
/// other like processes sharing one database.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    rows: Arc<Mutex<HashMap<(String, InstanceId), Holder>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the keys to a foreign owner, as if the lease had expired and was
    /// taken over. The current holder's next renewal fails.
    pub fn revoke(&self, projection: &str, instances: &[InstanceId]) {
        if let Ok(mut rows) = self.rows.lock() {
            for instance in instances {
                rows.insert(
                    (projection.to_string(), instance.clone()),
                    Holder {
                        owner: "revoked".to_string(),
                        until: Instant::now() + Duration::from_secs(3600),
                    },
                );
            }
        }
    }

    /// Current owner of a key, ignoring expiry.
    pub fn owner(&self, projection: &str, instance: &InstanceId) -> Option<String> {
        self.rows
            .lock()
            .ok()?
            .get(&(projection.to_string(), instance.clone()))
            .map(|holder| holder.owner.clone())
    }
}

/// In-memory locker for tests/dev.
#[derive(Debug, Clone)]
pub struct InMemoryLocker {
    table: LockTable,
    projection: String,
    owner: String,
}

impl InMemoryLocker {
    pub fn new(table: LockTable, projection: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            table,
            projection: projection.into(),
            owner: owner.into(),
        }
    }

    pub fn table(&self) -> &LockTable {
        &self.table
    }
}

#[async_trait::async_trait]
impl Lease for InMemoryLocker {
    fn projection(&self) -> &str {
        &self.projection
    }

    async fn try_acquire(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<(), LockError> {
        let mut rows = self
            .table
            .rows
            .lock()
            .map_err(|_| LockError::Storage("lock table poisoned".to_string()))?;

        let now = Instant::now();
        let contended: Vec<InstanceId> = instances
            .iter()
            .filter(|instance| {
                rows.get(&(self.projection.clone(), (*instance).clone()))
                    .is_some_and(|h| h.owner != self.owner && h.until > now)
            })
            .cloned()
            .collect();
        if !contended.is_empty() {
            return Err(LockError::AlreadyLocked {
                projection: self.projection.clone(),
                instances: contended,
            });
        }

        for instance in instances {
            rows.insert(
                (self.projection.clone(), instance.clone()),
                Holder {
                    owner: self.owner.clone(),
                    until: now + duration,
                },
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Locker for InMemoryLocker {
    async fn lock(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<LockSession, LockError> {
        LockSession::start(self.clone(), duration, instances).await
    }

    async fn unlock(&self, instances: &[InstanceId]) -> Result<(), LockError> {
        let mut rows = self
            .table
            .rows
            .lock()
            .map_err(|_| LockError::Storage("lock table poisoned".to_string()))?;
        for instance in instances {
            let key = (self.projection.clone(), instance.clone());
            if rows.get(&key).is_some_and(|h| h.owner == self.owner) {
                rows.remove(&key);
            }
        }
        Ok(())
    }
}
