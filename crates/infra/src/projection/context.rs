use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use forgeiam_core::InstanceId;

/// Execution context threaded through every projection call.
///
/// - `instance_id`: the tenant a call runs for when no instances are given
/// - `as_of`: reads only observe events created up to this point
/// - `cancel`: cooperative cancellation (shutdown, lost lock)
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    instance_id: Option<InstanceId>,
    as_of: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    /// Drop the read timestamp so later reads see newly committed data.
    pub fn reset_as_of(&mut self) {
        self.as_of = None;
    }

    /// Same context with a child cancellation token: cancelling the child
    /// leaves the parent running, cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            as_of: self.as_of,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let parent = ExecContext::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn reset_as_of_clears_read_timestamp() {
        let mut ctx = ExecContext::new()
            .with_instance("acme".into())
            .with_as_of(Utc::now());
        ctx.reset_as_of();
        assert!(ctx.as_of().is_none());
        assert_eq!(ctx.instance_id().map(|id| id.as_str()), Some("acme"));
    }
}
