//! Organizations projection.
//!
//! Maintains `projections.orgs` and the organization's verified domains in
//! `projections.org_domains`. Setting the primary domain touches both tables
//! in one multi statement.

use serde::Deserialize;

use forgeiam_events::{
    AggregateReducer, Column, Condition, Event, Operation, Projection, ReduceError, Statement,
    decode_payload,
};

pub const ORGS_PROJECTION: &str = "projections.orgs";
pub const ORGS_TABLE: &str = "projections.orgs";
pub const ORG_DOMAINS_TABLE: &str = "projections.org_domains";

pub const ORG_AGGREGATE: &str = "org";
pub const ORG_ADDED: &str = "org.added";
pub const ORG_CHANGED: &str = "org.changed";
pub const ORG_REMOVED: &str = "org.removed";
pub const ORG_DOMAIN_ADDED: &str = "org.domain.added";
pub const ORG_DOMAIN_PRIMARY_SET: &str = "org.domain.primary.set";

#[derive(Debug, Deserialize)]
struct OrgNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OrgDomain {
    domain: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrgsProjection;

impl Projection for OrgsProjection {
    fn name(&self) -> &str {
        ORGS_PROJECTION
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new(ORG_AGGREGATE)
                .on(ORG_ADDED, reduce_added)
                .on(ORG_CHANGED, reduce_changed)
                .on(ORG_REMOVED, reduce_removed)
                .on(ORG_DOMAIN_ADDED, reduce_domain_added)
                .on(ORG_DOMAIN_PRIMARY_SET, reduce_primary_domain_set),
        ]
    }
}

fn org_key(event: &Event) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.instance_id.as_str()),
        Condition::new("id", event.aggregate_id.as_str()),
    ]
}

fn domains_key(event: &Event) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", event.instance_id.as_str()),
        Condition::new("org_id", event.aggregate_id.as_str()),
    ]
}

fn changed(event: &Event) -> Vec<Column> {
    vec![
        Column::new("change_date", event.creation_date),
        Column::new("sequence", event.sequence),
    ]
}

fn named(event: &Event) -> Result<String, ReduceError> {
    let payload: OrgNamed = decode_payload(event)?;
    if payload.name.trim().is_empty() {
        return Err(ReduceError::invalid(event, "organization name must not be empty"));
    }
    Ok(payload.name)
}

fn reduce_added(event: &Event) -> Result<Statement, ReduceError> {
    let mut columns = vec![
        Column::new("instance_id", event.instance_id.as_str()),
        Column::new("id", event.aggregate_id.as_str()),
        Column::new("name", named(event)?),
        Column::new("state", "active"),
        Column::new("creation_date", event.creation_date),
    ];
    columns.extend(changed(event));
    Ok(Statement::create(event, ORGS_TABLE, columns))
}

fn reduce_changed(event: &Event) -> Result<Statement, ReduceError> {
    let mut columns = vec![Column::new("name", named(event)?)];
    columns.extend(changed(event));
    Ok(Statement::update(event, ORGS_TABLE, columns, org_key(event)))
}

fn reduce_removed(event: &Event) -> Result<Statement, ReduceError> {
    Ok(Statement::multi(
        event,
        vec![
            Operation::Delete {
                table: ORG_DOMAINS_TABLE.to_string(),
                conditions: domains_key(event),
            },
            Operation::Delete {
                table: ORGS_TABLE.to_string(),
                conditions: org_key(event),
            },
        ],
    ))
}

fn reduce_domain_added(event: &Event) -> Result<Statement, ReduceError> {
    let payload: OrgDomain = decode_payload(event)?;
    Ok(Statement::upsert(
        event,
        ORG_DOMAINS_TABLE,
        vec![
            Column::new("instance_id", event.instance_id.as_str()),
            Column::new("org_id", event.aggregate_id.as_str()),
            Column::new("domain", payload.domain),
            Column::new("is_primary", false),
            Column::new("creation_date", event.creation_date),
            Column::new("sequence", event.sequence),
        ],
        vec![
            "instance_id".to_string(),
            "org_id".to_string(),
            "domain".to_string(),
        ],
    ))
}

fn reduce_primary_domain_set(event: &Event) -> Result<Statement, ReduceError> {
    let payload: OrgDomain = decode_payload(event)?;

    let mut primary = domains_key(event);
    primary.push(Condition::new("domain", payload.domain.clone()));

    let mut org_columns = vec![Column::new("primary_domain", payload.domain)];
    org_columns.extend(changed(event));

    Ok(Statement::multi(
        event,
        vec![
            Operation::Update {
                table: ORG_DOMAINS_TABLE.to_string(),
                columns: vec![Column::new("is_primary", false)],
                conditions: domains_key(event),
            },
            Operation::Update {
                table: ORG_DOMAINS_TABLE.to_string(),
                columns: vec![Column::new("is_primary", true)],
                conditions: primary,
            },
            Operation::Update {
                table: ORGS_TABLE.to_string(),
                columns: org_columns,
                conditions: org_key(event),
            },
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forgeiam_events::OperationKind;
    use serde_json::json;

    fn event(event_type: &'static str, payload: serde_json::Value) -> Event {
        Event {
            aggregate_type: ORG_AGGREGATE.into(),
            aggregate_id: "o1".into(),
            instance_id: "acme".into(),
            event_type: event_type.into(),
            sequence: 10,
            previous_aggregate_sequence: 9,
            previous_aggregate_type_sequence: 9,
            creation_date: Utc::now(),
            payload,
        }
    }

    #[test]
    fn primary_domain_is_a_multi_statement() {
        let stmt = reduce_primary_domain_set(&event(
            ORG_DOMAIN_PRIMARY_SET,
            json!({ "domain": "acme.example" }),
        ))
        .unwrap();

        assert_eq!(stmt.kind(), OperationKind::Multi);
        let Operation::Multi(ops) = &stmt.operation else {
            panic!("expected multi");
        };
        assert_eq!(ops.len(), 3);
        assert!(stmt.operation.validate().is_ok());
    }

    #[test]
    fn removal_deletes_domains_and_org() {
        let stmt = reduce_removed(&event(ORG_REMOVED, json!({}))).unwrap();
        let Operation::Multi(ops) = &stmt.operation else {
            panic!("expected multi");
        };
        let tables: Vec<_> = ops.iter().filter_map(|op| op.table()).collect();
        assert_eq!(tables, vec![ORG_DOMAINS_TABLE, ORGS_TABLE]);
    }

    #[test]
    fn empty_name_fails_reduction() {
        assert!(reduce_added(&event(ORG_ADDED, json!({ "name": "" }))).is_err());
    }
}
