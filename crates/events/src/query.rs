//! Search queries consumed from the event source.
//!
//! A [`SearchQuery`] is a disjunction of [`QueryClause`]s; each clause is a
//! conjunction of its filters. The projection handler builds one clause per
//! (instance, aggregate type) so a single round trip fetches the next events
//! for every tenant it is responsible for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeiam_core::{AggregateId, AggregateType, EventType, InstanceId};

use crate::Event;

/// One AND-combined filter group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryClause {
    pub instance_id: Option<InstanceId>,
    pub excluded_instance_ids: Vec<InstanceId>,
    pub aggregate_types: Vec<AggregateType>,
    pub aggregate_ids: Vec<AggregateId>,
    pub event_types: Vec<EventType>,
    pub sequence_greater: Option<u64>,
    pub sequence_less: Option<u64>,
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound; pins reads to a point in time.
    pub created_until: Option<DateTime<Utc>>,
}

impl QueryClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn exclude_instance_ids(mut self, ids: impl IntoIterator<Item = InstanceId>) -> Self {
        self.excluded_instance_ids.extend(ids);
        self
    }

    pub fn aggregate_types(mut self, types: impl IntoIterator<Item = AggregateType>) -> Self {
        self.aggregate_types.extend(types);
        self
    }

    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids.extend(ids);
        self
    }

    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    pub fn sequence_greater(mut self, sequence: u64) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    pub fn sequence_less(mut self, sequence: u64) -> Self {
        self.sequence_less = Some(sequence);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_until(mut self, at: DateTime<Utc>) -> Self {
        self.created_until = Some(at);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(id) = &self.instance_id {
            if &event.instance_id != id {
                return false;
            }
        }
        if self.excluded_instance_ids.contains(&event.instance_id) {
            return false;
        }
        if !self.aggregate_types.is_empty() && !self.aggregate_types.contains(&event.aggregate_type)
        {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&event.aggregate_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if self.sequence_greater.is_some_and(|s| event.sequence <= s) {
            return false;
        }
        if self.sequence_less.is_some_and(|s| event.sequence >= s) {
            return false;
        }
        if self.created_after.is_some_and(|at| event.creation_date <= at) {
            return false;
        }
        if self.created_until.is_some_and(|at| event.creation_date > at) {
            return false;
        }
        true
    }
}

/// OR-combination of clauses, ordered ascending by sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub clauses: Vec<QueryClause>,
    pub limit: Option<u64>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn or(mut self, clause: QueryClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// An event matches when any clause matches. A query without clauses
    /// matches nothing.
    pub fn matches(&self, event: &Event) -> bool {
        self.clauses.iter().any(|clause| clause.matches(event))
    }
}

/// Query for instance ids with activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceQuery {
    /// Only instances with an event created after this point.
    pub created_after: Option<DateTime<Utc>>,
    pub excluded: Vec<InstanceId>,
}

impl InstanceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn exclude(mut self, id: InstanceId) -> Self {
        self.excluded.push(id);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.excluded.contains(&event.instance_id) {
            return false;
        }
        !self.created_after.is_some_and(|at| event.creation_date <= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event(instance: &'static str, aggregate_type: &'static str, sequence: u64) -> Event {
        Event {
            aggregate_type: aggregate_type.into(),
            aggregate_id: "a1".into(),
            instance_id: instance.into(),
            event_type: "x.added".into(),
            sequence,
            previous_aggregate_sequence: 0,
            previous_aggregate_type_sequence: 0,
            creation_date: Utc::now(),
            payload: json!(null),
        }
    }

    #[test]
    fn clauses_are_or_combined() {
        let query = SearchQuery::new()
            .or(QueryClause::new()
                .instance_id("a".into())
                .aggregate_types(["user".into()])
                .sequence_greater(5))
            .or(QueryClause::new()
                .instance_id("b".into())
                .aggregate_types(["user".into()]));

        assert!(!query.matches(&event("a", "user", 5)));
        assert!(query.matches(&event("a", "user", 6)));
        assert!(query.matches(&event("b", "user", 1)));
        assert!(!query.matches(&event("b", "org", 1)));
        assert!(!query.matches(&event("c", "user", 10)));
    }

    #[test]
    fn empty_query_matches_nothing() {
        assert!(!SearchQuery::new().matches(&event("a", "user", 1)));
    }

    #[test]
    fn sequence_bounds_are_exclusive() {
        let clause = QueryClause::new().sequence_greater(2).sequence_less(5);
        assert!(!clause.matches(&event("a", "user", 2)));
        assert!(clause.matches(&event("a", "user", 3)));
        assert!(clause.matches(&event("a", "user", 4)));
        assert!(!clause.matches(&event("a", "user", 5)));
    }

    #[test]
    fn instance_query_honours_window_and_exclusions() {
        let query = InstanceQuery::new()
            .created_after(Utc::now() - Duration::minutes(1))
            .exclude(InstanceId::system());

        assert!(query.matches(&event("a", "user", 1)));
        assert!(!query.matches(&event("system", "projection", 1)));

        let mut old = event("a", "user", 1);
        old.creation_date = Utc::now() - Duration::hours(1);
        assert!(!query.matches(&old));
    }
}
