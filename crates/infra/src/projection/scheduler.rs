//! Periodic sweep across instances.
//!
//! Two regimes:
//! - **first run**: until the projection's success marker exists, one process
//!   takes the `system` lock and catches up every instance. The marker is
//!   pushed only if no batch failed.
//! - **steady state**: instances with recent events are processed in batches
//!   of `concurrent_instances`, each batch under its own lock, at most
//!   `batch_concurrency` batches at a time.
//!
//! The first sweep after process start always covers every instance. Later
//! sweeps look back `active_instance_window` from the start of the last clean
//! sweep, so an instance that was quiet for a long time is still picked up the
//! next time it emits an event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use forgeiam_core::{AggregateId, AggregateType, EventType, InstanceId};
use forgeiam_events::{InstanceQuery, NewEvent, QueryClause, SearchQuery};

use crate::lock::watch_lock;
use crate::workers::{RestartPolicy, Supervisor, WorkerHandle};

use super::context::ExecContext;
use super::error::HandlerError;
use super::handler::ProjectionHandler;

/// Aggregate type of scheduler markers.
pub const MARKER_AGGREGATE_TYPE: &str = "projection";
/// Event type of the first-run success marker.
pub const SUCCEEDED_ONCE_EVENT: &str = "projection.scheduler.succeeded";

/// Sweep bookkeeping kept across ticks of one scheduler.
///
/// Starts empty in every process, which is what makes the first sweep after
/// start cover every instance.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    last_clean_sweep: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Start time of the last sweep in which no batch failed.
    pub fn last_clean_sweep(&self) -> Option<DateTime<Utc>> {
        self.last_clean_sweep
    }
}

/// Which regime a sweep ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// No success marker yet: catch up every instance under the system lock.
    FirstRun,
    /// Marker present: windowed instances, one lock per batch.
    SteadyState,
}

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub regime: Regime,
    /// Instances the sweep enumerated.
    pub instances: usize,
    /// Batches whose lock could not be taken or whose trigger failed.
    pub failed_batches: usize,
    /// The system lock was held elsewhere; nothing ran.
    pub skipped: bool,
}

impl ProjectionHandler {
    /// Run the scheduler loop under a supervisor until `shutdown`.
    ///
    /// Sweeps every `requeue_every`; a tick that would overlap a running
    /// sweep is delayed, not stacked. A failed sweep is logged and the next
    /// tick tries again. Each sweep gets a child of `shutdown`, so shutdown
    /// also interrupts in-flight batches.
    pub fn schedule(self: &Arc<Self>, shutdown: CancellationToken) -> WorkerHandle {
        let handler = self.clone();
        Supervisor::spawn(
            format!("{}.scheduler", self.name),
            RestartPolicy::default(),
            shutdown,
            move |token| {
                let handler = handler.clone();
                async move {
                    handler.run_scheduler(token).await;
                    Ok::<(), HandlerError>(())
                }
            },
        )
    }

    async fn run_scheduler(self: Arc<Self>, token: CancellationToken) {
        let mut state = SchedulerState::default();
        let mut interval = tokio::time::interval(self.config.requeue_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let ctx = ExecContext::new().with_cancel(token.child_token());
                    if let Err(err) = self.sweep(&ctx, &mut state).await {
                        error!(projection = %self.name, error = %err, "scheduled sweep failed");
                    }
                }
            }
        }
    }

    /// One scheduler tick.
    ///
    /// ## First run
    ///
    /// While the projection's success marker is missing, the sweep takes the
    /// `system` lock. If another process holds it the outcome is `skipped`.
    /// Otherwise every instance is triggered, and the marker is pushed only if
    /// no batch failed and the lock was not lost meanwhile.
    ///
    /// ## Steady state
    ///
    /// Instances come from the event source, limited to those with events
    /// after `last_clean_sweep - active_instance_window` (all of them when
    /// `state` is fresh). Each batch is triggered under its own lock. A
    /// failing batch is counted and does not stop its siblings.
    ///
    /// `state.last_clean_sweep` only advances when no batch failed.
    ///
    /// # Errors
    ///
    /// Only event source failures while reading the marker or the instances,
    /// or while pushing the marker. Batch failures are reported through
    /// [`SweepOutcome::failed_batches`].
    pub async fn sweep(
        self: &Arc<Self>,
        ctx: &ExecContext,
        state: &mut SchedulerState,
    ) -> Result<SweepOutcome, HandlerError> {
        let started = Utc::now();
        if !self.has_succeeded_once().await? {
            return self.first_run(ctx, state, started).await;
        }

        let mut query = InstanceQuery::new().exclude(InstanceId::system());
        if let Some(last) = state.last_clean_sweep {
            let window = chrono::Duration::from_std(self.config.active_instance_window())
                .unwrap_or(chrono::Duration::MAX);
            if let Some(since) = last.checked_sub_signed(window) {
                query = query.created_after(since);
            }
        }
        let instances = self.source.instance_ids(&query).await?;

        let failed_batches = self.trigger_batches(ctx, &instances, true).await;
        if failed_batches == 0 {
            state.last_clean_sweep = Some(started);
        }

        Ok(SweepOutcome {
            regime: Regime::SteadyState,
            instances: instances.len(),
            failed_batches,
            skipped: false,
        })
    }

    async fn first_run(
        self: &Arc<Self>,
        ctx: &ExecContext,
        state: &mut SchedulerState,
        started: DateTime<Utc>,
    ) -> Result<SweepOutcome, HandlerError> {
        let system = [InstanceId::system()];
        let mut session = match self.locker.lock(self.config.lock_duration(), &system).await {
            Ok(session) => session,
            Err(err) => {
                info!(projection = %self.name, error = %err, "first run is handled elsewhere");
                return Ok(SweepOutcome {
                    regime: Regime::FirstRun,
                    instances: 0,
                    failed_batches: 0,
                    skipped: true,
                });
            }
        };
        let work = ctx.child();
        let watcher = watch_lock(&mut session, work.token().clone());

        let result = async {
            let instances = self
                .source
                .instance_ids(&InstanceQuery::new().exclude(InstanceId::system()))
                .await?;
            let failed_batches = self.trigger_batches(&work, &instances, false).await;
            if failed_batches == 0 && !work.is_cancelled() {
                self.push_succeeded_marker().await?;
                state.last_clean_sweep = Some(started);
            }
            Ok::<_, HandlerError>(SweepOutcome {
                regime: Regime::FirstRun,
                instances: instances.len(),
                failed_batches,
                skipped: false,
            })
        }
        .await;

        session.stop();
        work.cancel();
        let _ = watcher.await;
        if let Err(err) = self.locker.unlock(&system).await {
            warn!(projection = %self.name, error = %err, "unlock failed");
        }
        result
    }

    /// Trigger `instances` in batches; returns the number of failed batches.
    async fn trigger_batches(
        self: &Arc<Self>,
        ctx: &ExecContext,
        instances: &[InstanceId],
        lock_batches: bool,
    ) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        let mut set = JoinSet::new();

        for batch in instances.chunks(self.config.concurrent_instances.max(1)) {
            let handler = self.clone();
            let ctx = ctx.clone();
            let batch = batch.to_vec();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                if lock_batches {
                    handler.trigger_locked(&ctx, &batch).await
                } else {
                    handler.trigger_logged(&ctx, &batch).await
                }
            });
        }

        let mut failed = 0;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(err) => {
                    error!(projection = %self.name, error = %err, "batch task panicked");
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn trigger_locked(&self, ctx: &ExecContext, batch: &[InstanceId]) -> bool {
        let mut session = match self.locker.lock(self.config.lock_duration(), batch).await {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    projection = %self.name,
                    instance_ids = ?batch,
                    error = %err,
                    "lock acquisition failed, batch skipped"
                );
                return false;
            }
        };
        let work = ctx.child();
        let watcher = watch_lock(&mut session, work.token().clone());

        let ok = self.trigger_logged(&work, batch).await;

        session.stop();
        work.cancel();
        let _ = watcher.await;
        if let Err(err) = self.locker.unlock(batch).await {
            warn!(projection = %self.name, instance_ids = ?batch, error = %err, "unlock failed");
        }
        ok
    }

    async fn trigger_logged(&self, ctx: &ExecContext, batch: &[InstanceId]) -> bool {
        match self.trigger_err(ctx, batch).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    projection = %self.name,
                    instance_ids = ?batch,
                    error = %err,
                    "trigger failed"
                );
                false
            }
        }
    }

    async fn has_succeeded_once(&self) -> Result<bool, HandlerError> {
        let query = SearchQuery::new()
            .or(QueryClause::new()
                .instance_id(InstanceId::system())
                .aggregate_types([AggregateType::from(MARKER_AGGREGATE_TYPE)])
                .aggregate_ids([AggregateId::from(self.name.clone())])
                .event_types([EventType::from(SUCCEEDED_ONCE_EVENT)]))
            .limit(1);
        Ok(!self.source.filter(&query).await?.is_empty())
    }

    async fn push_succeeded_marker(&self) -> Result<(), HandlerError> {
        self.source
            .push(vec![NewEvent::new(
                InstanceId::system(),
                MARKER_AGGREGATE_TYPE.into(),
                AggregateId::from(self.name.clone()),
                SUCCEEDED_ONCE_EVENT.into(),
                json!({ "projection": self.name }),
            )])
            .await?;
        info!(projection = %self.name, "first run succeeded");
        Ok(())
    }
}
