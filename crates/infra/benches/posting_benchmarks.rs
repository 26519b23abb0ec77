use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use invflow_auth::{Grant, Permission, StaticAuthorizer};
use invflow_core::{ProductId, UserId, WarehouseId};
use invflow_events::{EventEnvelope, InMemoryEventBus};
use invflow_infra::audit::InMemoryAuditSink;
use invflow_infra::idempotency::{IdempotencyGate, InMemoryIdempotencyStore};
use invflow_infra::stock_ledger::InMemoryStockLedger;
use invflow_infra::{CallOptions, EngineConfig, PostingEngine};
use invflow_inventory::{MovementLine, MovementType, PostMovement};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

struct Bench {
    engine: Arc<PostingEngine<Bus>>,
    warehouse: WarehouseId,
    clerk: UserId,
}

fn setup_posting_engine() -> Bench {
    let config = EngineConfig {
        lock_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    };
    let warehouse = WarehouseId::new();
    let clerk = UserId::new();
    let gate = Arc::new(IdempotencyGate::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        config.idempotency_ttl,
    ));
    let authz = Arc::new(StaticAuthorizer::new().with_grant(clerk, Grant::global(Permission::STOCK_POST)));
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let engine = PostingEngine::new(
        Arc::new(InMemoryStockLedger::new()),
        gate,
        authz,
        Arc::new(InMemoryAuditSink::new()),
        bus,
        &config,
    );
    Bench {
        engine: Arc::new(engine),
        warehouse,
        clerk,
    }
}

fn receipt(bench: &Bench, product: ProductId, qty: i64) -> PostMovement {
    PostMovement::new(
        MovementType::Receipt,
        bench.warehouse,
        bench.clerk,
        vec![MovementLine::receipt(product, qty)],
    )
}

fn bench_single_posting_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("posting_latency");

    group.bench_function("receipt_unkeyed", |b| {
        let bench = setup_posting_engine();
        let product = ProductId::new();
        b.to_async(&rt).iter(|| {
            let engine = bench.engine.clone();
            let request = receipt(&bench, product, black_box(5));
            async move {
                engine.post_movement(request, CallOptions::new()).await.unwrap();
            }
        });
    });

    group.bench_function("receipt_keyed", |b| {
        let bench = setup_posting_engine();
        let product = ProductId::new();
        let mut n = 0u64;
        b.to_async(&rt).iter(|| {
            n += 1;
            let opts = CallOptions::new().with_idempotency_key(format!("grn-{n}"));
            let request = receipt(&bench, product, 5);
            let engine = bench.engine.clone();
            async move {
                engine.post_movement(request, opts).await.unwrap();
            }
        });
    });

    // Three lines across three rows: lock ordering + multi-row commit.
    group.bench_function("receipt_three_lines", |b| {
        let bench = setup_posting_engine();
        let products = [ProductId::new(), ProductId::new(), ProductId::new()];
        b.to_async(&rt).iter(|| {
            let engine = bench.engine.clone();
            let request = PostMovement::new(
                MovementType::Receipt,
                bench.warehouse,
                bench.clerk,
                products.iter().map(|p| MovementLine::receipt(*p, 1)).collect(),
            );
            async move {
                engine.post_movement(request, CallOptions::new()).await.unwrap();
            }
        });
    });

    group.finish();
}

fn bench_posting_under_contention(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("posting_under_contention");
    group.sample_size(30);

    for concurrency in [4usize, 16, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));

        // Every task hits the same (warehouse, product) row.
        group.bench_with_input(BenchmarkId::new("hot_row", concurrency), &concurrency, |b, &n| {
            let bench = setup_posting_engine();
            let product = ProductId::new();
            b.to_async(&rt).iter(|| {
                let jobs: Vec<_> = (0..n)
                    .map(|_| (bench.engine.clone(), receipt(&bench, product, 1)))
                    .collect();
                async move {
                    let handles: Vec<_> = jobs
                        .into_iter()
                        .map(|(engine, request)| {
                            tokio::spawn(async move { engine.post_movement(request, CallOptions::new()).await })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                }
            });
        });

        // Each task posts to its own row.
        group.bench_with_input(BenchmarkId::new("distinct_rows", concurrency), &concurrency, |b, &n| {
            let bench = setup_posting_engine();
            let products: Vec<ProductId> = (0..n).map(|_| ProductId::new()).collect();
            b.to_async(&rt).iter(|| {
                let jobs: Vec<_> = products
                    .iter()
                    .map(|product| (bench.engine.clone(), receipt(&bench, *product, 1)))
                    .collect();
                async move {
                    let handles: Vec<_> = jobs
                        .into_iter()
                        .map(|(engine, request)| {
                            tokio::spawn(async move { engine.post_movement(request, CallOptions::new()).await })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_posting_latency, bench_posting_under_contention);
criterion_main!(benches);
