//! IAM projections (read model builders).
//!
//! Projections only describe how events reduce to statements; the projection
//! handler applies them. All projections are:
//! - **Rebuildable**: tables can be dropped and rebuilt from the event stream
//! - **Instance-isolated**: every row carries its `instance_id`
//! - **Idempotent**: sequence bookkeeping makes redelivery a no-op

pub mod orgs;
pub mod users;

pub use orgs::OrgsProjection;
pub use users::UsersProjection;
