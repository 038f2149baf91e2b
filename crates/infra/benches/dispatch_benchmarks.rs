use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use marketflow_core::{Clock, ManualClock};
use marketflow_events::{
    HandlerCatalog, HandlerContext, HandlerRegistry, IngestRequest, NewEvent, RetryPolicy,
    RoutingTable, handler_fn,
};
use marketflow_infra::handlers::{InMemoryPorts, standard_registry};
use marketflow_infra::{
    Dispatcher, EventStore, HandlerRuntime, InMemoryEventStore, IngestionService, RetryManager,
    RetrySweeper, SweeperConfig,
};
use tokio::runtime::Runtime;

type Store = Arc<InMemoryEventStore>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn dispatcher(registry: HandlerRegistry, clock: Arc<ManualClock>) -> Arc<Dispatcher<Store>> {
    Arc::new(Dispatcher::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(registry),
        HandlerRuntime::default(),
        RetryManager::new(RetryPolicy::fixed(5, Duration::from_secs(300))),
        clock,
    ))
}

/// A route with `fanout` handlers that all succeed immediately.
fn noop_registry(fanout: usize) -> HandlerRegistry {
    let names: Vec<String> = (0..fanout).map(|i| format!("noop_{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();

    let catalog = names.iter().fold(HandlerCatalog::new(), |catalog, name| {
        catalog.register(
            name.clone(),
            handler_fn(|_ctx: HandlerContext| async { Ok(()) }),
        )
    });
    HandlerRegistry::build(&RoutingTable::new().route("bench.event", &refs), &catalog).unwrap()
}

fn bench_ingest_latency(c: &mut Criterion) {
    let rt = runtime();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let ports = InMemoryPorts::new();
    let registry = standard_registry(&ports.ports(), clock.clone()).unwrap();
    let ingestion = IngestionService::new(dispatcher(registry, clock));
    let seq = AtomicU64::new(0);

    let mut group = c.benchmark_group("ingest_latency");

    group.bench_function("order_created_standard_handlers", |b| {
        b.iter(|| {
            let order_id = format!("ord_{}", seq.fetch_add(1, Ordering::Relaxed));
            let request = IngestRequest::new("order.created", order_id)
                .with_store("store_1")
                .with_payload(serde_json::json!({
                    "total_amount": 4500,
                    "currency": "KES",
                    "customer_email": "amina@example.com",
                }));
            black_box(rt.block_on(ingestion.ingest(request)).unwrap());
        });
    });

    rt.block_on(
        ingestion.ingest(
            IngestRequest::new("order.created", "ord_dup")
                .with_store("store_1")
                .with_payload(serde_json::json!({
                    "total_amount": 4500,
                    "currency": "KES",
                    "customer_email": "amina@example.com",
                })),
        ),
    )
    .unwrap();

    group.bench_function("duplicate_skipped", |b| {
        b.iter(|| {
            let request = IngestRequest::new("order.created", "ord_dup").with_store("store_1");
            black_box(rt.block_on(ingestion.ingest(request)).unwrap());
        });
    });

    group.finish();
}

fn bench_handler_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("handler_fanout");

    for fanout in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(*fanout as u64));
        group.bench_with_input(BenchmarkId::new("dispatch", fanout), fanout, |b, &n| {
            let ingestion = IngestionService::new(dispatcher(
                noop_registry(n),
                Arc::new(ManualClock::new(Utc::now())),
            ));
            let seq = AtomicU64::new(0);

            b.iter(|| {
                let aggregate_id = format!("agg_{}", seq.fetch_add(1, Ordering::Relaxed));
                black_box(
                    rt.block_on(ingestion.ingest(IngestRequest::new("bench.event", aggregate_id)))
                        .unwrap(),
                );
            });
        });
    }

    group.finish();
}

fn bench_sweep_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sweep_batch");

    for batch in [10u32, 100, 1000].iter() {
        group.throughput(Throughput::Elements(u64::from(*batch)));
        group.bench_with_input(BenchmarkId::new("orphaned_pending", batch), batch, |b, &n| {
            b.iter_batched(
                || {
                    // Pending rows old enough to count as orphaned.
                    let clock = Arc::new(ManualClock::new(Utc::now()));
                    let dispatcher = dispatcher(noop_registry(4), clock.clone());
                    let created_at = clock.now() - chrono::Duration::minutes(10);
                    rt.block_on(async {
                        for i in 0..n {
                            let event = NewEvent {
                                event_type: "bench.event".to_string(),
                                aggregate_type: "bench".to_string(),
                                aggregate_id: format!("agg_{i}"),
                                store_id: None,
                                payload: serde_json::json!({}),
                                max_retries: 5,
                            };
                            dispatcher.store().insert_or_get(event, created_at).await.unwrap();
                        }
                    });
                    let config = SweeperConfig {
                        batch_size: n,
                        ..SweeperConfig::default().with_max_concurrent(8)
                    };
                    RetrySweeper::new(dispatcher, config)
                },
                |sweeper| black_box(rt.block_on(sweeper.run_once()).unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_latency,
    bench_handler_fanout,
    bench_sweep_batch
);
criterion_main!(benches);
