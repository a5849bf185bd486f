//! Content-addressed store behaviour through the public service API.

mod common;

use std::sync::Arc;

use cas_tier_router::cache::{CacheEntry, CasError, Lookup, Origin, PutOutcome};
use cas_tier_router::config::Config;
use cas_tier_router::keys::{KeyContext, KeyEngine};
use cas_tier_router::service::Service;

use common::task;

fn context() -> KeyContext {
    KeyContext::at("ops", 1_700_000_000, 3600)
}

#[tokio::test]
async fn test_ingest_then_lookup_and_expand() {
    let service = Service::start(Config::default()).await.unwrap();
    let record = task();

    let staged = service.store.serializer().encode(&record).unwrap();
    assert_eq!(staged.sizes(), [61, 31, 16]);
    let key = KeyEngine::new().derive_for(&staged.compact().bytes, &context(), "task-1");

    assert_eq!(service.store.get(&key), Lookup::Miss);

    let receipt = service.ingestor.ingest(&record, &context(), "task-1").await.unwrap();
    assert_eq!(receipt.key, key);
    assert_eq!(receipt.outcome, PutOutcome::Inserted);
    assert_eq!(receipt.stage_sizes, [61, 31, 16]);

    match service.store.get(&key) {
        Lookup::Hit(payload) => assert_eq!(payload.len(), 16),
        Lookup::Miss => panic!("expected a hit after ingest"),
    }
    let expanded = service.store.expand(&key).unwrap();
    assert_eq!(expanded, record);
    assert_eq!(expanded.canonical_bytes().unwrap().len(), 61);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let service = Service::start(Config::default()).await.unwrap();
    let first = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();
    let second = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();

    assert_eq!(first.key, second.key);
    assert_eq!(second.outcome, PutOutcome::AlreadyExists);
    assert_eq!(service.store.len(), 1);
}

#[tokio::test]
async fn test_concurrent_puts_collapse_to_one_insert() {
    let service = Service::start(Config::default()).await.unwrap();
    let ingestor = Arc::clone(&service.ingestor);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.ingest(&task(), &context(), "task-1").await })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().outcome == PutOutcome::Inserted {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(service.store.len(), 1);
}

#[tokio::test]
async fn test_distinct_identity_gives_distinct_key() {
    let service = Service::start(Config::default()).await.unwrap();
    let a = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();
    let b = service.ingestor.ingest(&task(), &context(), "task-2").await.unwrap();

    assert_ne!(a.key, b.key);
    assert_eq!(a.key.content, b.key.content);
    assert_eq!(service.store.len(), 2);
}

#[tokio::test]
async fn test_forged_fingerprint_is_a_collision() {
    let service = Service::start(Config::default()).await.unwrap();
    let receipt = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();
    let original = service.store.peek(&receipt.key).unwrap();

    let forged = CacheEntry::new(
        receipt.key,
        original.payload.clone(),
        cas_tier_router::keys::Fingerprint(original.fingerprint.0 ^ 1),
        None,
        Origin::Ingested,
        1.0,
    );
    let err = service.writer.put(forged).await.unwrap_err();
    assert!(matches!(err, CasError::KeyCollision { .. }));
    assert_eq!(service.store.expand(&receipt.key).unwrap(), task());
}

#[tokio::test]
async fn test_invalidate_removes_entry() {
    let service = Service::start(Config::default()).await.unwrap();
    let receipt = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();

    assert!(service.writer.invalidate(receipt.key).await.unwrap());
    assert!(!service.writer.invalidate(receipt.key).await.unwrap());
    assert!(matches!(service.store.expand(&receipt.key), Err(CasError::NotFound(_))));
}

#[tokio::test]
async fn test_archive_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.archive.path = Some(dir.path().to_path_buf());

    let service = Service::start(config.clone()).await.unwrap();
    let receipt = service.ingestor.ingest(&task(), &context(), "task-1").await.unwrap();
    service.shutdown().await.unwrap();

    let restarted = Service::start(config).await.unwrap();
    assert!(restarted.store.contains(&receipt.key));
    assert_eq!(restarted.store.expand(&receipt.key).unwrap(), task());
    assert_eq!(restarted.store.stats().ingested, 1);
}
