//! Infrastructure layer: event source, locks, projection engine, Postgres
//! schema and configuration.

pub mod config;
pub mod event_store;
pub mod lock;
pub mod projection;
pub mod projections;
pub mod schema;
pub mod workers;
