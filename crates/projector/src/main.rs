//! Projector process: keeps the IAM projections up to date.
//!
//! Environment:
//! - `DATABASE_URL` (required): Postgres holding the event log and projections
//! - `DATABASE_MAX_CONNECTIONS` (default 10)
//! - `FORGEIAM_PROJECTIONS_*`: projection options, see `ProjectionsConfig`
//! - `RUST_LOG`, `LOG_FORMAT`: logging
//!
//! The in-process bus only carries events pushed through this process, which
//! are the scheduler's own markers. Events written by other services reach
//! the projections through the scheduler, so real-time subscription is off
//! unless `FORGEIAM_PROJECTIONS_SUBSCRIBE=true` asks for it.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use forgeiam_events::{Event, InMemoryEventBus, Projection};
use forgeiam_infra::config::{ENV_PREFIX, ProjectionsConfig};
use forgeiam_infra::event_store::{EventSource, PostgresEventSource, PublishingEventSource};
use forgeiam_infra::lock::{PostgresLocker, new_locker_id};
use forgeiam_infra::projection::{PostgresProjectionStore, ProjectionHandler, ProjectionStore};
use forgeiam_infra::projections::{OrgsProjection, UsersProjection};
use forgeiam_infra::schema::ensure_schema;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgeiam_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS {raw:?}"))?,
        Err(_) => 10,
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    ensure_schema(&pool).await.context("failed to ensure schema")?;

    let subscribe_key = format!("{ENV_PREFIX}SUBSCRIBE");
    let config = ProjectionsConfig::from_lookup(|key| {
        std::env::var(key)
            .ok()
            .or_else(|| (key == subscribe_key).then(|| "false".to_string()))
    });
    let owner = new_locker_id();
    let bus = Arc::new(InMemoryEventBus::<Event>::new());
    let source: Arc<dyn EventSource> = Arc::new(PublishingEventSource::new(
        PostgresEventSource::new(pool.clone()),
        bus.clone(),
    ));
    let store: Arc<dyn ProjectionStore> = Arc::new(PostgresProjectionStore::new(pool.clone()));

    let projections: Vec<Box<dyn Projection>> =
        vec![Box::new(UsersProjection), Box::new(OrgsProjection)];

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();
    for projection in &projections {
        let name = projection.name();
        let projection_config = config.for_projection(name);
        projection_config
            .validate()
            .with_context(|| format!("invalid configuration for {name}"))?;

        let locker = PostgresLocker::new(pool.clone(), name, owner.clone());
        let handler = Arc::new(ProjectionHandler::new(
            projection.as_ref(),
            projection_config,
            source.clone(),
            store.clone(),
            Arc::new(locker),
        ));
        workers.extend(handler.start(bus.clone(), shutdown.clone()));
        tracing::info!(
            projection = name,
            locker_id = %owner,
            subscribe = handler.config().subscribe,
            "projection started"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    shutdown.cancel();
    for worker in workers {
        if let Some(report) = worker.shutdown().await {
            tracing::debug!(restarts = report.restarts, exit = ?report.last_exit, "worker stopped");
        }
    }
    pool.close().await;
    Ok(())
}
