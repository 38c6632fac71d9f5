use forgeiam_core::InstanceId;

use crate::{Event, Statement};

/// Types bound to exactly one instance (tenant).
///
/// Sequence bookkeeping, failure counters and locks are all partitioned by
/// instance; anything flowing through the projection handler exposes its
/// instance through this trait.
pub trait InstanceScoped {
    fn instance_id(&self) -> &InstanceId;
}

impl InstanceScoped for Event {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
}

impl InstanceScoped for Statement {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
}

/// Distinct instance ids of `items`, in first-seen order.
pub fn distinct_instances<'a, T>(items: impl IntoIterator<Item = &'a T>) -> Vec<InstanceId>
where
    T: InstanceScoped + 'a,
{
    let mut ids: Vec<InstanceId> = Vec::new();
    for item in items {
        let id = item.instance_id();
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}
