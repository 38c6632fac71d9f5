use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use forgeiam_core::InstanceId;
use forgeiam_events::{Event, NewEvent, ReducerRegistry, Statement};
use forgeiam_infra::event_store::{EventSource, InMemoryEventSource};
use forgeiam_infra::projection::{ExecContext, InMemoryProjectionStore, StatementHandler};
use forgeiam_infra::projections::UsersProjection;
use forgeiam_infra::projections::users::{USER_ADDED, USER_AGGREGATE, USERS_PROJECTION};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn users(rt: &Runtime, instances: usize, per_instance: usize) -> (Arc<InMemoryEventSource>, Vec<Event>) {
    let source = Arc::new(InMemoryEventSource::new());
    let mut batch = Vec::with_capacity(instances * per_instance);
    for i in 0..per_instance {
        for instance in 0..instances {
            batch.push(NewEvent::new(
                InstanceId::from(format!("instance-{instance}")),
                USER_AGGREGATE.into(),
                format!("user-{i}").into(),
                USER_ADDED.into(),
                json!({ "username": format!("user{i}"), "email": "bench@example.test" }),
            ));
        }
    }
    let events = rt.block_on(source.push(batch)).unwrap();
    (source, events)
}

fn handler(source: Arc<InMemoryEventSource>) -> StatementHandler {
    StatementHandler::new(
        USERS_PROJECTION,
        Arc::new(InMemoryProjectionStore::new()),
        source,
        Arc::new(ReducerRegistry::for_projection(&UsersProjection)),
        5,
        200,
    )
}

/// Reduction only: events → statements.
fn bench_reduce(c: &mut Criterion) {
    let rt = runtime();
    let registry = ReducerRegistry::for_projection(&UsersProjection);
    let mut group = c.benchmark_group("reduce");

    for size in [10usize, 100, 1000] {
        let (_, events) = users(&rt, 1, size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| black_box(registry.reduce_all(events).unwrap()));
        });
    }
    group.finish();
}

/// One `update` call over a fresh store: savepoint per statement plus the
/// sequence upserts.
fn bench_update(c: &mut Criterion) {
    let rt = runtime();
    let registry = ReducerRegistry::for_projection(&UsersProjection);
    let mut group = c.benchmark_group("statement_handler_update");

    for (instances, per_instance) in [(1usize, 100usize), (10, 10), (10, 100)] {
        let (source, events) = users(&rt, instances, per_instance);
        let statements: Vec<Statement> = registry.reduce_all(&events).unwrap();
        group.throughput(Throughput::Elements(statements.len() as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{instances}_instances"), statements.len()),
            &statements,
            |b, statements| {
                b.iter(|| {
                    let handler = handler(source.clone());
                    rt.block_on(handler.update(&ExecContext::new(), statements))
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

/// Redelivery of an already applied batch: every statement is dropped by the
/// sequence check.
fn bench_redelivery(c: &mut Criterion) {
    let rt = runtime();
    let registry = ReducerRegistry::for_projection(&UsersProjection);
    let (source, events) = users(&rt, 1, 200);
    let statements = registry.reduce_all(&events).unwrap();
    let handler = handler(source);
    rt.block_on(handler.update(&ExecContext::new(), &statements))
        .unwrap();

    c.bench_function("statement_handler_redelivery_200", |b| {
        b.iter(|| {
            rt.block_on(handler.update(&ExecContext::new(), black_box(&statements)))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_reduce, bench_update, bench_redelivery);
criterion_main!(benches);
