use std::collections::HashMap;

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::Statement;

/// Key of a current-sequence row within one projection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey {
    pub aggregate_type: AggregateType,
    pub instance_id: InstanceId,
}

impl SequenceKey {
    pub fn new(aggregate_type: AggregateType, instance_id: InstanceId) -> Self {
        Self {
            aggregate_type,
            instance_id,
        }
    }

    pub fn of(stmt: &Statement) -> Self {
        Self::new(stmt.aggregate_type.clone(), stmt.instance_id.clone())
    }
}

/// A stored current-sequence row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSequence {
    pub aggregate_type: AggregateType,
    pub instance_id: InstanceId,
    pub sequence: u64,
}

/// Highest applied sequence per (aggregate type, instance).
///
/// Missing keys read as `0`: nothing applied yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceMap(HashMap<SequenceKey, u64>);

impl SequenceMap {
    pub fn get(&self, key: &SequenceKey) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Raise `key` to `sequence`; lower values are ignored.
    pub fn advance(&mut self, key: SequenceKey, sequence: u64) {
        let current = self.0.entry(key).or_insert(0);
        if sequence > *current {
            *current = sequence;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SequenceKey, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<CurrentSequence> for SequenceMap {
    fn from_iter<I: IntoIterator<Item = CurrentSequence>>(iter: I) -> Self {
        let mut map = Self::default();
        for row in iter {
            map.advance(SequenceKey::new(row.aggregate_type, row.instance_id), row.sequence);
        }
        map
    }
}
