//! Transactional application of statement batches.
//!
//! `update` runs one transaction per call:
//! 1. lock the current sequences of every (aggregate type, instance) in the batch
//! 2. drop statements at or below the stored sequence (already applied)
//! 3. fill sequence gaps by fetching and reducing the missing events, spliced
//!    in before the statement that revealed the gap
//! 4. execute each statement in its own savepoint; on error roll back the
//!    savepoint and count the failure for that event
//! 5. raise the sequence rows to the last applied statement and commit
//!
//! An event whose failure count exceeds the configured maximum is skipped and
//! its sequence is passed. Any other execution failure stops the batch: the
//! statements before it are committed and the caller learns the resume point
//! through [`HandlerError::SomeStatementsFailed`].

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use forgeiam_core::{AggregateType, InstanceId};
use forgeiam_events::{QueryClause, ReducerRegistry, SearchQuery, Statement};

use crate::event_store::EventSource;

use super::context::ExecContext;
use super::error::{HandlerError, StorageError};
use super::sequence::{SequenceKey, SequenceMap};
use super::store::{ProjectionStore, ProjectionTx};

enum Step<'a> {
    /// Already applied; index into the caller's slice.
    Skip(usize),
    Run {
        statement: Cow<'a, Statement>,
        origin: Option<usize>,
    },
}

pub struct StatementHandler {
    projection: String,
    store: Arc<dyn ProjectionStore>,
    source: Arc<dyn EventSource>,
    reducers: Arc<ReducerRegistry>,
    max_failure_count: u32,
    bulk_limit: u64,
}

impl StatementHandler {
    pub fn new(
        projection: impl Into<String>,
        store: Arc<dyn ProjectionStore>,
        source: Arc<dyn EventSource>,
        reducers: Arc<ReducerRegistry>,
        max_failure_count: u32,
        bulk_limit: u64,
    ) -> Self {
        Self {
            projection: projection.into(),
            store,
            source,
            reducers,
            max_failure_count,
            bulk_limit,
        }
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Query for the next events of `instances`: one clause per (instance,
    /// aggregate type) starting after the stored sequence.
    #[instrument(skip(self, ctx), fields(projection = %self.projection), err)]
    pub async fn search_query(
        &self,
        ctx: &ExecContext,
        instances: &[InstanceId],
    ) -> Result<SearchQuery, HandlerError> {
        let current: SequenceMap = self
            .store
            .current_sequences(&self.projection, instances)
            .await?
            .into_iter()
            .collect();

        let mut query = SearchQuery::new().limit(self.bulk_limit);
        for instance in instances {
            for aggregate_type in self.reducers.aggregate_types() {
                let key = SequenceKey::new(aggregate_type.clone(), instance.clone());
                let mut clause = QueryClause::new()
                    .instance_id(instance.clone())
                    .aggregate_types([aggregate_type])
                    .sequence_greater(current.get(&key));
                if let Some(as_of) = ctx.as_of() {
                    clause = clause.created_until(as_of);
                }
                query = query.or(clause);
            }
        }
        Ok(query)
    }

    /// Apply `statements` in one transaction.
    ///
    /// Returns the index (into `statements`) of the last statement that is now
    /// reflected in storage, or `None` for an empty batch.
    #[instrument(
        skip(self, ctx, statements),
        fields(projection = %self.projection, statements = statements.len()),
        err
    )]
    pub async fn update(
        &self,
        ctx: &ExecContext,
        statements: &[Statement],
    ) -> Result<Option<usize>, HandlerError> {
        if statements.is_empty() {
            return Ok(None);
        }
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(HandlerError::transaction("begin"))?;

        let (aggregate_types, instances) = keys_of(statements);
        let current: SequenceMap = match tx
            .lock_sequences(&self.projection, &aggregate_types, &instances)
            .await
        {
            Ok(rows) => rows.into_iter().collect(),
            Err(err) => {
                return Err(self
                    .abort(tx, HandlerError::transaction("lock_sequences")(err))
                    .await);
            }
        };

        let plan = match self.plan(&current, statements).await {
            Ok(plan) => plan,
            Err(err) => return Err(self.abort(tx, err).await),
        };

        let (advanced, last_applied, failed) = match self.execute(ctx, tx.as_mut(), plan).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.abort(tx, err).await),
        };

        let mut advanced: Vec<_> = advanced.iter().collect();
        advanced.sort();
        for (key, sequence) in advanced {
            match tx.upsert_sequence(&self.projection, key, *sequence).await {
                Ok(0) => {
                    let err = HandlerError::SequenceUpdate {
                        aggregate_type: key.aggregate_type.clone(),
                        instance_id: key.instance_id.clone(),
                    };
                    return Err(self.abort(tx, err).await);
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(self
                        .abort(tx, HandlerError::transaction("upsert_sequence")(err))
                        .await);
                }
            }
        }

        if ctx.is_cancelled() {
            return Err(self.abort(tx, HandlerError::Cancelled).await);
        }
        tx.commit()
            .await
            .map_err(HandlerError::transaction("commit"))?;

        if failed {
            Err(HandlerError::SomeStatementsFailed { last_applied })
        } else {
            Ok(last_applied)
        }
    }

    /// Order the batch for execution: duplicates become skips and sequence
    /// gaps are filled from the event source.
    async fn plan<'a>(
        &self,
        current: &SequenceMap,
        statements: &'a [Statement],
    ) -> Result<Vec<Step<'a>>, HandlerError> {
        let mut known = current.clone();
        let mut plan = Vec::with_capacity(statements.len());

        for (idx, statement) in statements.iter().enumerate() {
            let key = SequenceKey::of(statement);
            let last = known.get(&key);

            if statement.sequence <= last {
                plan.push(Step::Skip(idx));
                continue;
            }

            if statement.previous_sequence != last {
                let query = SearchQuery::new().or(QueryClause::new()
                    .instance_id(statement.instance_id.clone())
                    .aggregate_types([statement.aggregate_type.clone()])
                    .sequence_greater(last)
                    .sequence_less(statement.sequence));
                let missing = self.source.filter(&query).await?;
                if !missing.is_empty() {
                    debug!(
                        projection = %self.projection,
                        aggregate_type = %statement.aggregate_type,
                        instance_id = %statement.instance_id,
                        sequence = statement.sequence,
                        missing = missing.len(),
                        "filling sequence gap"
                    );
                }
                for event in &missing {
                    plan.push(Step::Run {
                        statement: Cow::Owned(self.reducers.reduce(event)?),
                        origin: None,
                    });
                }
            }

            plan.push(Step::Run {
                statement: Cow::Borrowed(statement),
                origin: Some(idx),
            });
            known.advance(key, statement.sequence);
        }

        Ok(plan)
    }

    /// Execute the plan. Returns the sequences to store, the last applied
    /// caller index and whether a statement failed without being skipped.
    async fn execute(
        &self,
        ctx: &ExecContext,
        tx: &mut dyn ProjectionTx,
        plan: Vec<Step<'_>>,
    ) -> Result<(SequenceMap, Option<usize>, bool), HandlerError> {
        let mut advanced = SequenceMap::default();
        let mut last_applied = None;

        for step in plan {
            let (statement, origin) = match step {
                Step::Skip(idx) => {
                    debug!(projection = %self.projection, index = idx, "statement already applied, dropped");
                    last_applied = Some(idx);
                    continue;
                }
                Step::Run { statement, origin } => (statement, origin),
            };
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            tx.savepoint()
                .await
                .map_err(HandlerError::transaction("savepoint"))?;

            match tx.execute(&statement.operation).await {
                Ok(()) => {
                    tx.release_savepoint()
                        .await
                        .map_err(HandlerError::transaction("release_savepoint"))?;
                }
                Err(err) => {
                    if !self.on_failure(tx, &statement, err).await? {
                        return Ok((advanced, last_applied, true));
                    }
                }
            }

            advanced.advance(SequenceKey::of(&statement), statement.sequence);
            if let Some(idx) = origin {
                last_applied = Some(idx);
            }
        }

        Ok((advanced, last_applied, false))
    }

    /// Roll back the failed statement and count the failure. Returns `true`
    /// if the event exhausted its failures and is skipped.
    async fn on_failure(
        &self,
        tx: &mut dyn ProjectionTx,
        statement: &Statement,
        err: StorageError,
    ) -> Result<bool, HandlerError> {
        warn!(
            projection = %self.projection,
            aggregate_type = %statement.aggregate_type,
            instance_id = %statement.instance_id,
            sequence = statement.sequence,
            kind = %statement.kind(),
            error = %err,
            "statement execution failed"
        );

        tx.rollback_to_savepoint()
            .await
            .map_err(HandlerError::transaction("rollback_to_savepoint"))?;
        let count = tx
            .record_failure(&self.projection, statement, &err.to_string())
            .await
            .map_err(HandlerError::transaction("record_failure"))?;

        if count > self.max_failure_count {
            warn!(
                projection = %self.projection,
                instance_id = %statement.instance_id,
                sequence = statement.sequence,
                failure_count = count,
                "event failed too often, skipping"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn abort(&self, tx: Box<dyn ProjectionTx>, err: HandlerError) -> HandlerError {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(projection = %self.projection, error = %rollback_err, "rollback failed");
        }
        err
    }
}

fn keys_of(statements: &[Statement]) -> (Vec<AggregateType>, Vec<InstanceId>) {
    let mut aggregate_types: Vec<AggregateType> = Vec::new();
    let mut instances: Vec<InstanceId> = Vec::new();
    for statement in statements {
        if !aggregate_types.contains(&statement.aggregate_type) {
            aggregate_types.push(statement.aggregate_type.clone());
        }
        if !instances.contains(&statement.instance_id) {
            instances.push(statement.instance_id.clone());
        }
    }
    (aggregate_types, instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::testing::*;
    use crate::projection::{CurrentSequence, InMemoryProjectionStore};
    use forgeiam_events::{Column, Event, Operation, Statement};
    use serde_json::json;

    /// Store whose sequence reads find no rows, as seen by a transaction that
    /// read before a concurrent one inserted them.
    struct StaleReads(InMemoryProjectionStore);

    struct StaleTx(Box<dyn ProjectionTx>);

    #[async_trait::async_trait]
    impl ProjectionStore for StaleReads {
        async fn begin(&self) -> Result<Box<dyn ProjectionTx>, StorageError> {
            Ok(Box::new(StaleTx(self.0.begin().await?)))
        }

        async fn current_sequences(
            &self,
            projection: &str,
            instances: &[InstanceId],
        ) -> Result<Vec<CurrentSequence>, StorageError> {
            self.0.current_sequences(projection, instances).await
        }

        async fn failure_count(
            &self,
            projection: &str,
            instance_id: &InstanceId,
            sequence: u64,
        ) -> Result<u32, StorageError> {
            self.0.failure_count(projection, instance_id, sequence).await
        }
    }

    #[async_trait::async_trait]
    impl ProjectionTx for StaleTx {
        async fn lock_sequences(
            &mut self,
            _projection: &str,
            _aggregate_types: &[AggregateType],
            _instances: &[InstanceId],
        ) -> Result<Vec<CurrentSequence>, StorageError> {
            Ok(Vec::new())
        }

        async fn savepoint(&mut self) -> Result<(), StorageError> {
            self.0.savepoint().await
        }

        async fn rollback_to_savepoint(&mut self) -> Result<(), StorageError> {
            self.0.rollback_to_savepoint().await
        }

        async fn release_savepoint(&mut self) -> Result<(), StorageError> {
            self.0.release_savepoint().await
        }

        async fn execute(&mut self, operation: &Operation) -> Result<(), StorageError> {
            self.0.execute(operation).await
        }

        async fn upsert_sequence(
            &mut self,
            projection: &str,
            key: &SequenceKey,
            sequence: u64,
        ) -> Result<u64, StorageError> {
            self.0.upsert_sequence(projection, key, sequence).await
        }

        async fn record_failure(
            &mut self,
            projection: &str,
            statement: &Statement,
            error: &str,
        ) -> Result<u32, StorageError> {
            self.0.record_failure(projection, statement, error).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.0.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            self.0.rollback().await
        }
    }

    /// Three events of instance `a` with sequences 5, 6, 7.
    async fn five_six_seven(fx: &Fixture, second_name: &str) -> Vec<Event> {
        fx.push((0..4).map(|i| added("other", &format!("o{i}"), "o")).collect())
            .await;
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                added("a", "2", second_name),
                added("a", "3", "three"),
            ])
            .await;
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        events
    }

    fn reduce(events: &[Event]) -> Vec<Statement> {
        ReducerRegistry::for_projection(&TestProjection)
            .reduce_all(events)
            .unwrap()
    }

    #[tokio::test]
    async fn applies_batch_in_order_and_advances_sequence() {
        let fx = Fixture::new();
        let statements = reduce(&five_six_seven(&fx, "two").await);

        let res = fx.statements(5).update(&ExecContext::new(), &statements).await;

        assert_eq!(res.unwrap(), Some(2));
        assert_eq!(fx.sequence("a").await, Some(7));
        assert_eq!(fx.store.executed().len(), 3);
        assert_eq!(
            fx.names("a").await,
            vec![
                ("1".into(), "one".into()),
                ("2".into(), "two".into()),
                ("3".into(), "three".into()),
            ]
        );
    }

    #[tokio::test]
    async fn failing_statement_stops_batch_and_counts_failure() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let statements = reduce(&five_six_seven(&fx, "bad").await);

        let err = fx
            .statements(5)
            .update(&ExecContext::new(), &statements)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HandlerError::SomeStatementsFailed {
                last_applied: Some(0)
            }
        ));
        assert_eq!(fx.sequence("a").await, Some(5));
        assert_eq!(fx.names("a").await, vec![("1".into(), "one".into())]);
        let failed = fx
            .store
            .failed_event(TEST_PROJECTION, &instance("a"), 6)
            .await
            .unwrap();
        assert_eq!(failed.count, 1);
        assert!(failed.error.contains("injected"));
        assert_eq!(
            fx.store
                .failure_count(TEST_PROJECTION, &instance("a"), 6)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            fx.store
                .failure_count(TEST_PROJECTION, &instance("a"), 7)
                .await
                .unwrap(),
            0
        );
        // the statement after the failure is never attempted
        assert_eq!(fx.store.executed().len(), 2);
    }

    #[tokio::test]
    async fn sequences_are_kept_per_instance() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![added("a", "1", "one"), added("b", "1", "uno")])
            .await;

        let res = fx
            .statements(5)
            .update(&ExecContext::new(), &reduce(&events))
            .await;

        assert_eq!(res.unwrap(), Some(1));
        assert_eq!(fx.sequence("a").await, Some(1));
        assert_eq!(fx.sequence("b").await, Some(2));
        assert_eq!(fx.names("a").await, vec![("1".into(), "one".into())]);
        assert_eq!(fx.names("b").await, vec![("1".into(), "uno".into())]);
    }

    #[tokio::test]
    async fn redelivered_statements_are_dropped() {
        let fx = Fixture::new();
        let statements = reduce(&five_six_seven(&fx, "two").await);
        let handler = fx.statements(5);
        handler.update(&ExecContext::new(), &statements).await.unwrap();

        let res = handler.update(&ExecContext::new(), &statements).await;

        assert_eq!(res.unwrap(), Some(2));
        assert_eq!(fx.store.executed().len(), 3);
        assert_eq!(fx.sequence("a").await, Some(7));
    }

    #[tokio::test]
    async fn event_exceeding_failure_count_is_skipped() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let statements = reduce(&five_six_seven(&fx, "bad").await);
        let handler = fx.statements(1);

        assert!(handler.update(&ExecContext::new(), &statements).await.is_err());
        let res = handler.update(&ExecContext::new(), &statements).await;

        assert_eq!(res.unwrap(), Some(2));
        assert_eq!(fx.sequence("a").await, Some(7));
        assert_eq!(
            fx.names("a").await,
            vec![("1".into(), "one".into()), ("3".into(), "three".into())]
        );
        let failed = fx
            .store
            .failed_event(TEST_PROJECTION, &instance("a"), 6)
            .await
            .unwrap();
        assert_eq!(failed.count, 2);
    }

    #[tokio::test]
    async fn sequence_gap_is_filled_from_source() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                added("a", "2", "two"),
                renamed("a", "1", "uno"),
            ])
            .await;
        let last = reduce(&events[2..]);

        let res = fx.statements(5).update(&ExecContext::new(), &last).await;

        assert_eq!(res.unwrap(), Some(0));
        assert_eq!(fx.sequence("a").await, Some(3));
        assert_eq!(
            fx.names("a").await,
            vec![("1".into(), "uno".into()), ("2".into(), "two".into())]
        );
    }

    #[tokio::test]
    async fn reduce_failure_while_filling_gap_applies_nothing() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                new_event("a", "2", ADDED, json!({})),
                added("a", "3", "three"),
            ])
            .await;
        let last = reduce(&events[2..]);

        let err = fx
            .statements(5)
            .update(&ExecContext::new(), &last)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Reduce(_)));
        assert_eq!(fx.sequence("a").await, None);
        assert!(fx.names("a").await.is_empty());
        assert!(fx.store.executed().is_empty());
    }

    #[tokio::test]
    async fn concurrent_apply_of_same_events_is_rolled_back() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![added("a", "1", "one"), renamed("a", "1", "uno")])
            .await;
        let statements = reduce(&events);
        fx.statements(5)
            .update(&ExecContext::new(), &statements)
            .await
            .unwrap();

        // a second writer that read the sequences before the first committed
        let late = StatementHandler::new(
            TEST_PROJECTION,
            Arc::new(StaleReads(fx.store.clone())),
            fx.source.clone(),
            Arc::new(ReducerRegistry::for_projection(&TestProjection)),
            5,
            fast_config().bulk_limit,
        );
        let err = late
            .update(&ExecContext::new(), &statements)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::SequenceUpdate { .. }));
        assert_eq!(fx.sequence("a").await, Some(2));
        assert_eq!(fx.names("a").await, vec![("1".into(), "uno".into())]);
        // both writers executed, only the first one committed
        assert_eq!(fx.store.executed().len(), 4);
    }

    #[tokio::test]
    async fn out_of_order_batch_is_applied_in_sequence_order() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                renamed("a", "1", "uno"),
                renamed("a", "1", "eins"),
            ])
            .await;
        let mut statements = reduce(&events);
        statements.reverse();

        let res = fx.statements(5).update(&ExecContext::new(), &statements).await;

        assert_eq!(res.unwrap(), Some(2));
        assert_eq!(fx.names("a").await, vec![("1".into(), "eins".into())]);
        assert_eq!(fx.sequence("a").await, Some(3));
    }

    #[tokio::test]
    async fn rejected_sequence_update_rolls_back_everything() {
        let fx = Fixture::new();
        fx.store.reject_sequence_updates(true);
        let statements = reduce(&five_six_seven(&fx, "two").await);

        let err = fx
            .statements(5)
            .update(&ExecContext::new(), &statements)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::SequenceUpdate { .. }));
        assert!(fx.names("a").await.is_empty());
        assert_eq!(fx.sequence("a").await, None);
    }

    #[tokio::test]
    async fn multi_statement_rolls_back_as_a_unit() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let events = fx.push(vec![added("a", "1", "one")]).await;
        let row = |name: &str| Operation::Create {
            table: TABLE.to_string(),
            columns: vec![
                Column::new("instance_id", "a"),
                Column::new("id", name),
                Column::new("name", name),
            ],
            conflict: vec![],
        };
        let statement = Statement::multi(&events[0], vec![row("good"), row("bad")]);

        let res = fx
            .statements(5)
            .update(&ExecContext::new(), &[statement])
            .await;

        assert!(matches!(
            res,
            Err(HandlerError::SomeStatementsFailed { last_applied: None })
        ));
        assert!(fx.names("a").await.is_empty());
        assert_eq!(fx.sequence("a").await, None);
    }

    #[tokio::test]
    async fn search_query_starts_after_stored_sequence() {
        let fx = Fixture::new();
        let events = fx.push(vec![added("a", "1", "one")]).await;
        let handler = fx.statements(5);
        handler
            .update(&ExecContext::new(), &reduce(&events))
            .await
            .unwrap();

        let as_of = chrono::Utc::now();
        let query = handler
            .search_query(
                &ExecContext::new().with_as_of(as_of),
                &[instance("a"), instance("b")],
            )
            .await
            .unwrap();

        assert_eq!(query.limit, Some(fast_config().bulk_limit));
        assert_eq!(query.clauses.len(), 2);
        assert_eq!(query.clauses[0].instance_id, Some(instance("a")));
        assert_eq!(query.clauses[0].sequence_greater, Some(1));
        assert_eq!(query.clauses[1].sequence_greater, Some(0));
        assert_eq!(query.clauses[1].created_until, Some(as_of));
    }

    #[tokio::test]
    async fn cancelled_context_opens_no_transaction() {
        let fx = Fixture::new();
        let statements = reduce(&five_six_seven(&fx, "two").await);
        let ctx = ExecContext::new();
        ctx.cancel();

        let err = fx.statements(5).update(&ctx, &statements).await.unwrap_err();

        assert!(matches!(err, HandlerError::Cancelled));
        assert_eq!(fx.store.transactions(), 0);
    }

    #[test]
    fn keys_are_distinct() {
        let event = |instance: &str| Event {
            aggregate_type: AGGREGATE.into(),
            aggregate_id: "1".into(),
            instance_id: forgeiam_core::InstanceId::from(instance.to_string()),
            event_type: ADDED.into(),
            sequence: 1,
            previous_aggregate_sequence: 0,
            previous_aggregate_type_sequence: 0,
            creation_date: chrono::Utc::now(),
            payload: serde_json::json!({}),
        };
        let statements: Vec<_> = ["a", "b", "a"]
            .iter()
            .map(|i| Statement::noop(&event(i)))
            .collect();

        let (types, instances) = keys_of(&statements);

        assert_eq!(types.len(), 1);
        assert_eq!(instances, vec![instance("a"), instance("b")]);
    }
}
