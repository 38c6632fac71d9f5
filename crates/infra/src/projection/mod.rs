//! Projection engine.
//!
//! A projection turns the event log into query tables. The engine is split in
//! two halves:
//! - [`ProjectionHandler`]: decides *which* events to process and when
//!   (trigger, subscription, scheduler) and retries partial failures
//! - [`StatementHandler`]: applies reduced statements transactionally with
//!   per-statement savepoints and sequence bookkeeping
//!
//! Storage is abstracted behind [`ProjectionStore`] with Postgres and
//! in-memory implementations.

pub mod context;
pub mod error;
pub mod handler;
pub mod in_memory;
pub mod postgres;
pub mod scheduler;
pub mod sequence;
pub mod statement_handler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use context::ExecContext;
pub use error::{HandlerError, StorageError};
pub use handler::ProjectionHandler;
pub use in_memory::{FailedEvent, InMemoryProjectionStore, Row};
pub use postgres::PostgresProjectionStore;
pub use scheduler::{
    MARKER_AGGREGATE_TYPE, Regime, SUCCEEDED_ONCE_EVENT, SchedulerState, SweepOutcome,
};
pub use sequence::{CurrentSequence, SequenceKey, SequenceMap};
pub use statement_handler::StatementHandler;
pub use store::{ProjectionStore, ProjectionTx};
