//! Users projection.
//!
//! One row per user and instance in `projections.users`. Removed users are
//! deleted; locking only flips the state column.

use serde::Deserialize;

use forgeiam_events::{
    AggregateReducer, Column, Condition, Event, Projection, ReduceError, Statement,
    decode_payload,
};

pub const USERS_PROJECTION: &str = "projections.users";
pub const USERS_TABLE: &str = "projections.users";

pub const USER_AGGREGATE: &str = "user";
pub const USER_ADDED: &str = "user.added";
pub const USER_CHANGED: &str = "user.changed";
pub const USER_LOCKED: &str = "user.locked";
pub const USER_UNLOCKED: &str = "user.unlocked";
pub const USER_REMOVED: &str = "user.removed";

pub const STATE_ACTIVE: &str = "active";
pub const STATE_LOCKED: &str = "locked";

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UserAdded {
    username: String,
    email: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserChanged {
    username: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Projection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct UsersProjection;

impl Projection for UsersProjection {
    fn name(&self) -> &str {
        USERS_PROJECTION
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new(USER_AGGREGATE)
                .on(USER_ADDED, reduce_added)
                .on(USER_CHANGED, reduce_changed)
                .on(USER_LOCKED, reduce_locked)
                .on(USER_UNLOCKED, reduce_unlocked)
                .on(USER_REMOVED, reduce_removed),
        ]
    }
}

fn key(event: &Event) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.instance_id.as_str()),
        Condition::new("id", event.aggregate_id.as_str()),
    ]
}

fn changed(event: &Event) -> Vec<Column> {
    vec![
        Column::new("change_date", event.creation_date),
        Column::new("sequence", event.sequence),
    ]
}

fn reduce_added(event: &Event) -> Result<Statement, ReduceError> {
    let added: UserAdded = decode_payload(event)?;
    if added.username.trim().is_empty() {
        return Err(ReduceError::invalid(event, "username must not be empty"));
    }

    let mut columns = vec![
        Column::new("instance_id", event.instance_id.as_str()),
        Column::new("id", event.aggregate_id.as_str()),
        Column::new("username", added.username),
        Column::new("email", added.email),
        Column::new("display_name", added.display_name),
        Column::new("state", STATE_ACTIVE),
        Column::new("creation_date", event.creation_date),
    ];
    columns.extend(changed(event));

    Ok(Statement::upsert(
        event,
        USERS_TABLE,
        columns,
        vec!["instance_id".to_string(), "id".to_string()],
    ))
}

fn reduce_changed(event: &Event) -> Result<Statement, ReduceError> {
    let change: UserChanged = decode_payload(event)?;

    let mut columns = Vec::new();
    if let Some(username) = change.username {
        columns.push(Column::new("username", username));
    }
    if let Some(email) = change.email {
        columns.push(Column::new("email", email));
    }
    if let Some(display_name) = change.display_name {
        columns.push(Column::new("display_name", display_name));
    }
    columns.extend(changed(event));

    Ok(Statement::update(event, USERS_TABLE, columns, key(event)))
}

fn set_state(event: &Event, state: &str) -> Statement {
    let mut columns = vec![Column::new("state", state)];
    columns.extend(changed(event));
    Statement::update(event, USERS_TABLE, columns, key(event))
}

fn reduce_locked(event: &Event) -> Result<Statement, ReduceError> {
    Ok(set_state(event, STATE_LOCKED))
}

fn reduce_unlocked(event: &Event) -> Result<Statement, ReduceError> {
    Ok(set_state(event, STATE_ACTIVE))
}

fn reduce_removed(event: &Event) -> Result<Statement, ReduceError> {
    Ok(Statement::delete(event, USERS_TABLE, key(event)))
}
