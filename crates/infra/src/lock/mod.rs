//! Distributed locks keyed by (projection name, instance id).
//!
//! Acquisition is two-phase:
//! 1. `Locker::lock` either fails (another owner holds at least one key) or
//!    returns a [`LockSession`].
//! 2. The session renews the lease in the background every third of its
//!    duration. If a renewal fails the lease is considered lost and
//!    [`LockSession::lost`] resolves; [`watch_lock`] turns that into a
//!    cancellation of the work context.
//!
//! `unlock` is best-effort: leases expire on their own.

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryLocker, LockTable};
pub use postgres::PostgresLocker;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use forgeiam_core::InstanceId;

#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("lock {projection} is held by another owner for instances {instances:?}")]
    AlreadyLocked {
        projection: String,
        instances: Vec<InstanceId>,
    },

    #[error("lock storage failed: {0}")]
    Storage(String),

    #[error("no instances given to lock")]
    NoInstances,
}

/// Fresh locker id for this process.
pub fn new_locker_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Lock manager bound to one projection and one owner.
#[async_trait::async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the lease on every `(projection, instance)` key for `duration`.
    async fn lock(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<LockSession, LockError>;

    /// Release keys held by this owner. Idempotent.
    async fn unlock(&self, instances: &[InstanceId]) -> Result<(), LockError>;
}

/// Storage half of a locker: one acquire-or-renew round trip.
#[async_trait::async_trait]
pub(crate) trait Lease: Clone + Send + Sync + 'static {
    fn projection(&self) -> &str;

    /// Take or extend the lease. Fails unless every key ends up owned by
    /// this owner; a failed attempt leaves no key changed.
    async fn try_acquire(
        &self,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<(), LockError>;
}

/// A held lease.
///
/// Dropping the session stops renewal; the lease then expires unless it is
/// released explicitly.
#[derive(Debug)]
pub struct LockSession {
    instances: Vec<InstanceId>,
    stop: CancellationToken,
    lost: Option<oneshot::Receiver<LockError>>,
}

impl LockSession {
    pub(crate) async fn start<L: Lease>(
        lease: L,
        duration: Duration,
        instances: &[InstanceId],
    ) -> Result<Self, LockError> {
        if instances.is_empty() {
            return Err(LockError::NoInstances);
        }
        lease.try_acquire(duration, instances).await?;

        let stop = CancellationToken::new();
        let (lost_tx, lost_rx) = oneshot::channel();
        let every = (duration / 3).max(Duration::from_millis(1));
        let keys = instances.to_vec();

        tokio::spawn({
            let stop = stop.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(every) => {
                            if let Err(err) = lease.try_acquire(duration, &keys).await {
                                warn!(
                                    projection = lease.projection(),
                                    instance_ids = ?keys,
                                    error = %err,
                                    "lock renewal failed, lease lost"
                                );
                                let _ = lost_tx.send(err);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            instances: instances.to_vec(),
            stop,
            lost: Some(lost_rx),
        })
    }

    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    /// Resolves once the lease is involuntarily lost.
    ///
    /// Never resolves if renewal was stopped or the loss was already taken
    /// by a watcher.
    pub async fn lost(&mut self) -> LockError {
        if let Some(rx) = self.lost.take() {
            if let Ok(err) = rx.await {
                return err;
            }
        }
        std::future::pending().await
    }

    /// Stop renewing. The lease runs out at its current expiry.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Cancel `token` when the session's lease is lost.
///
/// The watcher ends on its own when `token` is cancelled or the session stops
/// renewing.
pub fn watch_lock(session: &mut LockSession, token: CancellationToken) -> JoinHandle<()> {
    let lost = session.lost.take();
    let instances = session.instances.clone();
    tokio::spawn(async move {
        let Some(lost) = lost else {
            return;
        };
        tokio::select! {
            _ = token.cancelled() => {}
            res = lost => {
                if let Ok(err) = res {
                    warn!(instance_ids = ?instances, error = %err, "lock lost, cancelling work");
                    token.cancel();
                } else {
                    debug!(instance_ids = ?instances, "lock session ended");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locker_ids_are_unique() {
        assert_ne!(new_locker_id(), new_locker_id());
    }
}
