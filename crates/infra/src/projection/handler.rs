//! Projection handler: intake, reduction and retries.
//!
//! Two intake paths drive a projection:
//! - **subscription**: events from the in-process bus, processed as they arrive
//!   (no lock; the sequence check makes overlap harmless)
//! - **scheduler**: periodic sweep across instances under distributed locks
//!   (see `scheduler.rs`)
//!
//! Both end up in [`ProjectionHandler::process`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, EventBus, Projection, ReducerRegistry, Subscription};

use crate::config::ProjectionConfig;
use crate::event_store::EventSource;
use crate::lock::Locker;
use crate::workers::{Supervisor, WorkerHandle};

use super::context::ExecContext;
use super::error::HandlerError;
use super::statement_handler::StatementHandler;
use super::store::ProjectionStore;

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one projection: fetches its events, reduces them to statements and
/// hands them to the [`StatementHandler`].
///
/// The handler is shared between its intake tasks, so it is usually held in an
/// `Arc` ([`subscribe`](Self::subscribe), [`start`](Self::start) and
/// [`sweep`](Self::sweep) take `self: &Arc<Self>`).
///
/// ## Concurrency
///
/// Any number of `process` calls may run at once, in this process or in
/// others. The statement handler's transactional sequence check turns an
/// overlapping apply into a no-op or a rolled back transaction, never a
/// double apply.
pub struct ProjectionHandler {
    pub(super) name: String,
    pub(super) config: ProjectionConfig,
    pub(super) reducers: Arc<ReducerRegistry>,
    pub(super) statements: StatementHandler,
    pub(super) source: Arc<dyn EventSource>,
    pub(super) locker: Arc<dyn Locker>,
}

impl ProjectionHandler {
    /// Build a handler for `projection`.
    ///
    /// The reducer registry is derived from the projection once; `config`
    /// supplies the retry, batching and lock settings.
    pub fn new<P>(
        projection: &P,
        config: ProjectionConfig,
        source: Arc<dyn EventSource>,
        store: Arc<dyn ProjectionStore>,
        locker: Arc<dyn Locker>,
    ) -> Self
    where
        P: Projection + ?Sized,
    {
        let name = projection.name().to_string();
        let reducers = Arc::new(ReducerRegistry::for_projection(projection));
        let statements = StatementHandler::new(
            name.clone(),
            store,
            source.clone(),
            reducers.clone(),
            config.max_failure_count,
            config.bulk_limit,
        );
        Self {
            name,
            config,
            reducers,
            statements,
            source,
            locker,
        }
    }

    /// Projection name, also the key of its sequence and lock rows.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// The statement handler applying this projection's batches.
    pub fn statements(&self) -> &StatementHandler {
        &self.statements
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trigger / process
    // ─────────────────────────────────────────────────────────────────────────

    /// Bring `instances` (or the context's instance) up to date, logging
    /// failures.
    ///
    /// Never fails: errors are logged with the projection name and instance
    /// ids and the next trigger or scheduler tick retries.
    pub async fn trigger(&self, ctx: &ExecContext, instances: &[InstanceId]) {
        if let Err(err) = self.trigger_err(ctx, instances).await {
            error!(
                projection = %self.name,
                instance_ids = ?instances,
                error = %err,
                "trigger failed"
            );
        }
    }

    /// Like [`trigger`](Self::trigger) but returns the first error.
    ///
    /// Fetches and processes bounded batches until a batch comes back smaller
    /// than the bulk limit. The context's `as_of` only applies to the first
    /// batch; later batches see everything committed since.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::NoInstance`] if neither `instances` nor the context
    ///   name an instance
    /// - [`HandlerError::Cancelled`] once the context is cancelled
    /// - anything [`process`](Self::process) or the event source returns
    pub async fn trigger_err(
        &self,
        ctx: &ExecContext,
        instances: &[InstanceId],
    ) -> Result<(), HandlerError> {
        let instances = if !instances.is_empty() {
            instances.to_vec()
        } else if let Some(id) = ctx.instance_id() {
            vec![id.clone()]
        } else {
            return Err(HandlerError::NoInstance);
        };

        let mut ctx = ctx.clone();
        loop {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let query = self.statements.search_query(&ctx, &instances).await?;
            let events = self.source.filter(&query).await?;
            if events.is_empty() {
                return Ok(());
            }
            let fetched = events.len() as u64;

            self.process(&ctx, &events).await?;
            ctx.reset_as_of();

            if fetched < self.config.bulk_limit {
                return Ok(());
            }
        }
    }

    /// Reduce `events` and apply them, retrying partially failed batches.
    ///
    /// Reduction happens up front: one failing reducer fails the whole call
    /// before anything is applied. Each retry resumes after the last applied
    /// statement and waits `retry_failed_after` first; the wait ends early
    /// when the context is cancelled.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Reduce`] if any event fails to reduce
    /// - [`HandlerError::SomeStatementsFailed`] after `max_retries` retries,
    ///   carrying the last applied index into `events`
    /// - any other error of [`StatementHandler::update`], unretried
    pub async fn process(&self, ctx: &ExecContext, events: &[Event]) -> Result<(), HandlerError> {
        let statements = self.reducers.reduce_all(events)?;

        let mut offset = 0usize;
        let mut attempt = 0u32;
        loop {
            match self.statements.update(ctx, &statements[offset..]).await {
                Ok(_) => return Ok(()),
                Err(HandlerError::SomeStatementsFailed { last_applied }) => {
                    if let Some(idx) = last_applied {
                        offset += idx + 1;
                    }
                    if attempt >= self.config.max_retries {
                        return Err(HandlerError::SomeStatementsFailed {
                            last_applied: offset.checked_sub(1),
                        });
                    }
                    attempt += 1;
                    warn!(
                        projection = %self.name,
                        attempt,
                        remaining = statements.len() - offset,
                        "some statements failed, retrying"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_failed_after) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intake tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Run the real-time intake under a supervisor.
    ///
    /// The loop waits for one event, drains whatever else is already queued
    /// and processes the lot as one batch. Events of aggregate types the
    /// projection does not reduce are dropped. No lock is taken.
    ///
    /// The first subscription is taken before this returns, so nothing
    /// published afterwards is missed; restarts subscribe anew and rely on the
    /// scheduler for events published in between. Restarts follow
    /// `config.restart`.
    pub fn subscribe<B>(self: &Arc<Self>, bus: Arc<B>, shutdown: CancellationToken) -> WorkerHandle
    where
        B: EventBus<Event> + 'static,
    {
        let handler = self.clone();
        let mut first = Some(bus.subscribe());
        Supervisor::spawn(
            format!("{}.subscription", self.name),
            self.config.restart.clone(),
            shutdown,
            move |token| {
                let handler = handler.clone();
                let subscription = first.take().unwrap_or_else(|| bus.subscribe());
                async move { handler.run_subscription(subscription, token).await }
            },
        )
    }

    async fn run_subscription(
        &self,
        mut subscription: Subscription<Event>,
        token: CancellationToken,
    ) -> Result<(), HandlerError> {
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                batch = subscription.recv_batch() => batch,
            };
            if batch.is_empty() {
                // bus dropped
                return Ok(());
            }

            let events: Vec<Event> = batch
                .into_iter()
                .filter(|event| self.reducers.handles(&event.aggregate_type))
                .collect();
            if events.is_empty() {
                continue;
            }

            let ctx = ExecContext::new().with_cancel(token.child_token());
            if let Err(err) = self.process(&ctx, &events).await {
                let instances = forgeiam_events::distinct_instances(&events);
                error!(
                    projection = %self.name,
                    instance_ids = ?instances,
                    error = %err,
                    "processing subscribed events failed"
                );
            }
        }
    }

    /// Start every intake path the configuration enables: the subscription if
    /// `subscribe` is set, and always the scheduler.
    ///
    /// Cancel `shutdown` and [`WorkerHandle::shutdown`] every returned handle
    /// to stop them.
    pub fn start<B>(self: &Arc<Self>, bus: Arc<B>, shutdown: CancellationToken) -> Vec<WorkerHandle>
    where
        B: EventBus<Event> + 'static,
    {
        let mut handles = Vec::with_capacity(2);
        if self.config.subscribe {
            handles.push(self.subscribe(bus, shutdown.clone()));
        }
        handles.push(self.schedule(shutdown));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::testing::*;
    use forgeiam_events::InMemoryEventBus;
    use serde_json::json;
    use std::time::Duration;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn trigger_catches_up_given_instances() {
        let fx = Fixture::new();
        fx.push(vec![
            added("a", "1", "one"),
            added("b", "1", "uno"),
            renamed("a", "1", "eins"),
        ])
        .await;
        let handler = fx.handler(fast_config());

        handler
            .trigger_err(&ExecContext::new(), &[instance("a")])
            .await
            .unwrap();

        assert_eq!(fx.names("a").await, vec![("1".into(), "eins".into())]);
        assert!(fx.names("b").await.is_empty());
        assert_eq!(fx.sequence("a").await, Some(3));
    }

    #[tokio::test]
    async fn trigger_falls_back_to_context_instance() {
        let fx = Fixture::new();
        fx.push(vec![added("b", "1", "uno")]).await;
        let handler = fx.handler(fast_config());

        let ctx = ExecContext::new().with_instance(instance("b"));
        handler.trigger_err(&ctx, &[]).await.unwrap();

        assert_eq!(fx.names("b").await, vec![("1".into(), "uno".into())]);
    }

    #[tokio::test]
    async fn trigger_without_instance_fails() {
        let fx = Fixture::new();
        let handler = fx.handler(fast_config());

        let err = handler
            .trigger_err(&ExecContext::new(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::NoInstance));
    }

    #[tokio::test]
    async fn trigger_loops_until_batch_is_short() {
        let fx = Fixture::new();
        fx.push((0..5).map(|i| added("a", &i.to_string(), "n")).collect())
            .await;
        let handler = fx.handler(fast_config().with_bulk_limit(2));

        handler
            .trigger_err(&ExecContext::new(), &[instance("a")])
            .await
            .unwrap();

        assert_eq!(fx.names("a").await.len(), 5);
        assert_eq!(fx.sequence("a").await, Some(5));
        // 2 + 2 + 1
        assert_eq!(fx.store.transactions(), 3);
    }

    #[tokio::test]
    async fn reduce_failure_applies_nothing() {
        let fx = Fixture::new();
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                new_event("a", "2", ADDED, json!({})),
            ])
            .await;
        let handler = fx.handler(fast_config());

        let err = handler
            .process(&ExecContext::new(), &events)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Reduce(_)));
        assert_eq!(fx.store.transactions(), 0);
        assert_eq!(fx.sequence("a").await, None);
    }

    #[tokio::test]
    async fn retries_resume_after_last_applied_statement() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                added("a", "2", "bad"),
                added("a", "3", "three"),
            ])
            .await;
        let handler = fx.handler(fast_config().with_max_failure_count(10));

        let err = handler
            .process(&ExecContext::new(), &events)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HandlerError::SomeStatementsFailed {
                last_applied: Some(0)
            }
        ));
        // first attempt plus two retries
        let failed = fx
            .store
            .failed_event(TEST_PROJECTION, &instance("a"), 2)
            .await
            .unwrap();
        assert_eq!(failed.count, 3);
        assert_eq!(fx.sequence("a").await, Some(1));
    }

    #[tokio::test]
    async fn retries_skip_event_once_failures_are_exhausted() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let events = fx
            .push(vec![
                added("a", "1", "one"),
                added("a", "2", "bad"),
                added("a", "3", "three"),
            ])
            .await;
        let handler = fx.handler(fast_config().with_max_failure_count(1));

        handler.process(&ExecContext::new(), &events).await.unwrap();

        assert_eq!(
            fx.names("a").await,
            vec![("1".into(), "one".into()), ("3".into(), "three".into())]
        );
        assert_eq!(fx.sequence("a").await, Some(3));
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_backoff() {
        let fx = Fixture::new();
        fx.store.fail_on(TABLE, "name", "bad");
        let events = fx.push(vec![added("a", "1", "bad")]).await;
        let handler = fx.handler(
            fast_config()
                .with_max_failure_count(10)
                .with_retry_failed_after(Duration::from_secs(3600)),
        );
        let ctx = ExecContext::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = handler.process(&ctx, &events).await.unwrap_err();

        assert!(matches!(err, HandlerError::Cancelled));
    }

    #[tokio::test]
    async fn subscription_projects_published_events() {
        let fx = Fixture::new();
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let handler = fx.handler(fast_config());
        let shutdown = CancellationToken::new();
        let worker = handler.subscribe(bus.clone(), shutdown.clone());

        for event in fx
            .push(vec![added("a", "1", "one"), renamed("a", "1", "uno")])
            .await
        {
            bus.publish(event).unwrap();
        }

        let fx_ref = &fx;
        eventually(|| async move { fx_ref.sequence("a").await == Some(2) }).await;
        assert_eq!(fx.names("a").await, vec![("1".into(), "uno".into())]);

        shutdown.cancel();
        let report = worker.shutdown().await.unwrap();
        assert_eq!(report.restarts, 0);
    }

    #[tokio::test]
    async fn subscription_ignores_foreign_aggregates() {
        let fx = Fixture::new();
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let handler = fx.handler(fast_config());
        let shutdown = CancellationToken::new();
        let worker = handler.subscribe(bus.clone(), shutdown.clone());

        let foreign = fx
            .push(vec![forgeiam_events::NewEvent::new(
                instance("a"),
                "y".into(),
                "1".into(),
                "y.added".into(),
                json!({}),
            )])
            .await;
        bus.publish(foreign[0].clone()).unwrap();
        for event in fx.push(vec![added("a", "1", "one")]).await {
            bus.publish(event).unwrap();
        }

        let fx_ref = &fx;
        eventually(|| async move { fx_ref.sequence("a").await == Some(2) }).await;
        assert_eq!(fx.store.executed().len(), 1);

        worker.shutdown().await;
    }
}
