use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use eventide_core::AggregateRef;
use eventide_domain::{CounterCommand, DomainAggregate, DomainTopics};
use eventide_events::{
    AggregateEngine, EventBus, InMemoryEventBus, NewEvent, SubscriptionPattern, TopicResolver,
    Versioned,
};
use eventide_infra::event_store::{EventStore, InMemoryEventStore};
use eventide_infra::{CommandOrchestrator, CommitNotifier, OrchestratorConfig};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn increment() -> NewEvent {
    NewEvent::new("counter.incremented", br#"{"Incremented":{"by":1}}"#.to_vec())
}

async fn seeded_store(events: u64) -> (Arc<InMemoryEventStore>, AggregateRef) {
    let store = Arc::new(InMemoryEventStore::new());
    let r = AggregateRef::new("counter", "bench").unwrap();
    for version in 0..events {
        store.append(&r, version, vec![increment()]).await.unwrap();
    }
    (store, r)
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                let r = AggregateRef::new("counter", "bench").unwrap();
                let mut version = 0u64;

                b.iter(|| {
                    let events: Vec<NewEvent> = (0..size).map(|_| increment()).collect();
                    let committed = rt.block_on(store.append(&r, version, events)).unwrap();
                    version += committed.len() as u64;
                    black_box(committed);
                });
            },
        );
    }

    group.finish();
}

fn bench_rehydration(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rehydration");

    for event_count in [10u64, 100, 1000, 10000].iter() {
        let (store, r) = rt.block_on(seeded_store(*event_count));
        group.throughput(Throughput::Elements(*event_count));
        group.bench_with_input(
            BenchmarkId::new("full_fold", event_count),
            event_count,
            |b, _| {
                b.iter(|| {
                    let history = rt.block_on(store.load(&r, 0)).unwrap();
                    let mut state = Versioned::<DomainAggregate>::initial(r.clone()).unwrap();
                    state.fold(history.iter().map(Arc::as_ref)).unwrap();
                    black_box(state.state.view());
                });
            },
        );
    }

    group.finish();
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("command_execution_latency");

    for (name, snapshot_every) in [("no_snapshots", 0u64), ("snapshot_every_100", 100)] {
        let (store, r) = rt.block_on(seeded_store(1000));
        let orchestrator: CommandOrchestrator<_, DomainAggregate> = CommandOrchestrator::with_config(
            store,
            CommitNotifier::new(),
            OrchestratorConfig {
                snapshot_every,
                ..OrchestratorConfig::default()
            },
        );
        group.bench_function(name, |b| {
            b.iter(|| {
                let committed = rt
                    .block_on(orchestrator.execute(&r, CounterCommand::Increment { by: 1 }.into()))
                    .unwrap();
                black_box(committed);
            });
        });
    }

    group.finish();
}

fn bench_bus_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_fan_out");
    let topics = DomainTopics;

    for subscribers in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("publish", subscribers),
            subscribers,
            |b, &count| {
                let bus = InMemoryEventBus::with_capacity(1024);
                let mut subs: Vec<_> = (0..count)
                    .map(|i| {
                        let pattern = if i % 2 == 0 { "**" } else { "metrics/counter/*" };
                        bus.subscribe(SubscriptionPattern::parse(pattern).unwrap())
                    })
                    .collect();
                let r = AggregateRef::new("counter", "bench").unwrap();
                let topic = topics.topic_for(&r);
                let event = Arc::new(eventide_events::Event::commit(
                    r,
                    1,
                    1,
                    increment(),
                    chrono::Utc::now(),
                ));

                b.iter(|| {
                    bus.publish(&topic, Arc::clone(&event)).unwrap();
                    for sub in &mut subs {
                        black_box(sub.try_recv().unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_rehydration,
    bench_command_execution_latency,
    bench_bus_fan_out
);
criterion_main!(benches);
