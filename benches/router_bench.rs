//! Benchmarks for staging, key derivation and the Tier A path.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use cas_tier_router::cache::evictor::Evictor;
use cas_tier_router::cache::entry::{ArchivedEntry, CacheEntry, Origin, Tier};
use cas_tier_router::config::{Config, EvictionConfig};
use cas_tier_router::keys::{Fingerprint, KeyContext, KeyEngine, TrivariateKey};
use cas_tier_router::router::ExecutionRequest;
use cas_tier_router::service::Service;
use cas_tier_router::staging::{Record, StagedSerializer};

fn task() -> Record {
    Record::from_value(json!({
        "schema": "task",
        "fields": {
            "name": "Recon",
            "priority": "high",
            "steps": ["hunt", "detect", "disrupt"],
            "owner": {"name": "ops", "region": "north"}
        }
    }))
    .unwrap()
}

fn bench_staging(c: &mut Criterion) {
    let serializer = StagedSerializer::default();
    let record = task();
    let staged = serializer.encode(&record).unwrap();

    c.bench_function("stage_encode", |b| {
        b.iter(|| black_box(serializer.encode(black_box(&record)).unwrap()))
    });
    c.bench_function("stage_decode_record", |b| {
        b.iter(|| black_box(serializer.decode_record(black_box(&staged.compact().bytes)).unwrap()))
    });
}

fn bench_keys(c: &mut Criterion) {
    let engine = KeyEngine::new();
    let payload = StagedSerializer::default().encode(&task()).unwrap().compact().bytes.clone();
    let context = KeyContext::at("ops", 1_700_000_000, 3600);

    c.bench_function("key_derive", |b| {
        b.iter(|| black_box(engine.derive_for(black_box(&payload), &context, "task-1")))
    });
}

fn bench_eviction(c: &mut Criterion) {
    let evictor = Evictor::new(EvictionConfig {
        max_entries: 10_000,
        ..EvictionConfig::default()
    });
    let now = 10_000_000u64;
    let entries: Vec<Arc<CacheEntry>> = (0..10_000u64)
        .map(|i| {
            Arc::new(CacheEntry::from(ArchivedEntry {
                key: TrivariateKey {
                    content: i,
                    context: 0,
                    identity: 0,
                },
                payload: vec![1; 16],
                fingerprint: Fingerprint(i as u128),
                chain: None,
                origin: Origin::Promoted(Tier::C),
                confidence: 0.9,
                created_at_ms: i,
                last_access_ms: i * 2,
                hit_count: 0,
            }))
        })
        .collect();

    c.bench_function("eviction_select_from_10k", |b| {
        b.iter(|| black_box(evictor.select_victims(black_box(&entries), now)))
    });
}

fn bench_tier_a(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::default();
    config.promotion.frequency_threshold = 1;
    let service = rt.block_on(Service::start(config)).unwrap();
    let request = ExecutionRequest::new(
        Record::from_value(json!({"schema": "query", "fields": {"operation": "ROUTE"}})).unwrap(),
        KeyContext::at("ops", 1_700_000_000, 3600),
        "analyst-1",
    );
    let first = rt.block_on(service.router.execute(request.clone())).unwrap();
    let hit = rt.block_on(service.router.execute(request.clone())).unwrap();
    assert_eq!((first.tier, hit.tier), (Tier::B, Tier::A));

    c.bench_function("execute_tier_a_hit", |b| {
        b.iter(|| black_box(rt.block_on(service.router.execute(request.clone())).unwrap()))
    });
}

criterion_group!(benches, bench_staging, bench_keys, bench_eviction, bench_tier_a);
criterion_main!(benches);
