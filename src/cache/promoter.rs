//! Promotion & eviction manager: the only writer to the content store.
//!
//! All inserts, promotions, evictions and invalidations are commands on one
//! queue drained by a single task, so store writes never race each other.
//! Callers hold a cloneable [`CasWriter`] and await a reply per command.
//!
//! A key is promoted into Tier A once it has been observed
//! `frequency_threshold` times and its latest result's confidence is at
//! least `min_confidence`. Until then its [`PromotionRecord`] stays pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::archive::{ArchiveError, EntryArchive};
use crate::cache::entry::{unix_millis, CacheEntry, Origin, Tier};
use crate::cache::evictor::{EvictionReason, Evictor};
use crate::cache::store::{CasError, ContentStore, PutOutcome};
use crate::config::{Config, PromotionConfig};
use crate::keys::{Fingerprint, KeyEngine, TrivariateKey};
use crate::metrics::Metrics;
use crate::staging::Record;

/// A completed Tier B/C result offered for promotion.
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: TrivariateKey,
    pub fingerprint: Fingerprint,
    pub answer: Record,
    pub confidence: f64,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Threshold reached but the latest confidence is too low.
    LowConfidence,
    /// Another entry already holds the key with the same content.
    AlreadyPresent,
    /// Another entry holds the key with different content.
    Collision,
    /// The answer could not be staged.
    Unstageable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::AlreadyPresent => "already_present",
            RejectReason::Collision => "collision",
            RejectReason::Unstageable => "unstageable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Promoted,
    Rejected(RejectReason),
}

/// Pending promotion candidate.
#[derive(Debug, Clone)]
pub struct PromotionRecord {
    pub key: TrivariateKey,
    pub fingerprint: Fingerprint,
    pub answer: Record,
    pub confidence: f64,
    pub tier: Tier,
    /// Observations since first seen.
    pub hits: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub decision: Decision,
}

impl PromotionRecord {
    fn new(observation: Observation, now: Instant) -> Self {
        Self {
            key: observation.key,
            fingerprint: observation.fingerprint,
            answer: observation.answer,
            confidence: observation.confidence,
            tier: observation.tier,
            hits: 0,
            first_seen: now,
            last_seen: now,
            decision: Decision::Pending,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub stale_evicted: usize,
    pub capacity_evicted: usize,
    pub expired_candidates: usize,
}

enum WriteCommand {
    Put {
        entry: CacheEntry,
        reply: oneshot::Sender<Result<PutOutcome, CasError>>,
    },
    Observe {
        observation: Observation,
        reply: oneshot::Sender<Decision>,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
    Invalidate {
        key: TrivariateKey,
        reply: oneshot::Sender<bool>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the writer task.
#[derive(Clone)]
pub struct CasWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl CasWriter {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WriteCommand,
    ) -> Result<T, CasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CasError::WriterClosed)?;
        rx.await.map_err(|_| CasError::WriterClosed)
    }

    /// Insert an entry.
    pub async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, CasError> {
        self.request(|reply| WriteCommand::Put { entry, reply }).await?
    }

    /// Offer a computed result for promotion. The reply arrives after the
    /// decision is committed.
    pub async fn observe(&self, observation: Observation) -> Result<Decision, CasError> {
        self.request(|reply| WriteCommand::Observe { observation, reply }).await
    }

    /// Run an eviction sweep now.
    pub async fn sweep(&self) -> Result<SweepReport, CasError> {
        self.request(|reply| WriteCommand::Sweep { reply }).await
    }

    /// Remove a key and any pending promotion for it.
    pub async fn invalidate(&self, key: TrivariateKey) -> Result<bool, CasError> {
        self.request(|reply| WriteCommand::Invalidate { key, reply }).await
    }

    /// Wait until every command sent before this one has been applied.
    pub async fn flush(&self) -> Result<(), CasError> {
        self.request(|reply| WriteCommand::Flush { reply }).await
    }
}

/// The writer task's state.
pub struct PromotionManager {
    store: Arc<ContentStore>,
    config: PromotionConfig,
    evictor: Evictor,
    sweep_interval: Duration,
    records: HashMap<TrivariateKey, PromotionRecord>,
    archive: Option<EntryArchive>,
    metrics: Arc<Metrics>,
    keys: KeyEngine,
}

impl PromotionManager {
    pub fn new(
        store: Arc<ContentStore>,
        config: &Config,
        metrics: Arc<Metrics>,
        archive: Option<EntryArchive>,
    ) -> Self {
        Self {
            store,
            config: config.promotion.clone(),
            evictor: Evictor::new(config.eviction.clone()),
            sweep_interval: config.eviction.sweep_interval(),
            records: HashMap::new(),
            archive,
            metrics,
            keys: KeyEngine::new(),
        }
    }

    /// Load archived entries into the store. Call before [`spawn`](Self::spawn).
    pub async fn restore(&mut self) -> Result<usize, ArchiveError> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let mut restored = 0;
        for entry in archive.load_all().await? {
            match self.store.put(entry) {
                Ok(PutOutcome::Inserted) => restored += 1,
                Ok(PutOutcome::AlreadyExists) => {}
                Err(e) => warn!(error = %e, "Skipping archived entry"),
            }
        }
        self.update_gauges();
        Ok(restored)
    }

    /// Start the writer task.
    pub fn spawn(self) -> (CasWriter, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let handle = tokio::spawn(self.run(rx));
        (CasWriter { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriteCommand>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = self.sweep_interval.as_secs(), "CAS writer started");
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("CAS writer stopped");
    }

    async fn handle(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Put { entry, reply } => {
                let _ = reply.send(self.put(entry).await);
            }
            WriteCommand::Observe { observation, reply } => {
                let _ = reply.send(self.observe(observation).await);
            }
            WriteCommand::Sweep { reply } => {
                let _ = reply.send(self.sweep().await);
            }
            WriteCommand::Invalidate { key, reply } => {
                let _ = reply.send(self.invalidate(key).await);
            }
            WriteCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn put(&mut self, entry: CacheEntry) -> Result<PutOutcome, CasError> {
        let key = entry.key;
        let outcome = self.store.put(entry).inspect_err(|_| self.metrics.record_collision())?;
        if outcome == PutOutcome::Inserted {
            if let (Some(archive), Some(stored)) = (self.archive.as_mut(), self.store.peek(&key)) {
                if let Err(e) = archive.write(&stored).await {
                    error!(key = %key, error = %e, "Failed to archive entry");
                }
            }
            self.update_gauges();
        }
        Ok(outcome)
    }

    async fn observe(&mut self, observation: Observation) -> Decision {
        let now = Instant::now();
        let key = observation.key;

        if !self.records.contains_key(&key) && self.records.len() >= self.config.max_pending {
            self.drop_least_recent();
        }
        let record = self
            .records
            .entry(key)
            .or_insert_with(|| PromotionRecord::new(observation.clone(), now));
        if record.fingerprint != observation.fingerprint {
            *record = PromotionRecord::new(observation.clone(), now);
        }
        record.hits += 1;
        record.answer = observation.answer;
        record.confidence = observation.confidence;
        record.tier = observation.tier;
        record.last_seen = now;

        let decision = if record.hits < self.config.frequency_threshold {
            Decision::Pending
        } else if record.confidence < self.config.min_confidence {
            Decision::Rejected(RejectReason::LowConfidence)
        } else {
            let record = record.clone();
            self.records.remove(&key);
            self.promote(record).await
        };

        if let Some(record) = self.records.get_mut(&key) {
            record.decision = decision;
        }
        if let Decision::Rejected(reason) = decision {
            self.metrics.record_rejection(reason.as_str());
        }
        self.metrics.set_pending_promotions(self.records.len());
        debug!(key = %key, decision = ?decision, "Observed result");
        decision
    }

    async fn promote(&mut self, record: PromotionRecord) -> Decision {
        let staged = match self.store.serializer().encode(&record.answer) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(key = %record.key, error = %e, "Cannot stage answer for promotion");
                return Decision::Rejected(RejectReason::Unstageable);
            }
        };
        self.metrics.record_staging(&staged.chain);

        let entry = CacheEntry::new(
            record.key,
            staged.compact().bytes.clone(),
            record.fingerprint,
            Some(staged.chain),
            Origin::Promoted(record.tier),
            record.confidence,
        );
        match self.put(entry).await {
            Ok(PutOutcome::Inserted) => {
                self.metrics.record_promotion();
                info!(
                    key = %record.key,
                    tier = %record.tier,
                    hits = record.hits,
                    confidence = record.confidence,
                    "Promoted result to Tier A"
                );
                Decision::Promoted
            }
            Ok(PutOutcome::AlreadyExists) => Decision::Rejected(RejectReason::AlreadyPresent),
            Err(e) => {
                warn!(key = %record.key, error = %e, "Promotion rejected");
                Decision::Rejected(RejectReason::Collision)
            }
        }
    }

    fn drop_least_recent(&mut self) {
        if let Some(oldest) = self
            .records
            .values()
            .min_by_key(|r| r.last_seen)
            .map(|r| r.key)
        {
            self.records.remove(&oldest);
            debug!(key = %oldest, "Dropped pending promotion record");
        }
    }

    async fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();

        let ttl = Duration::from_secs(self.config.candidate_ttl_secs);
        let before = self.records.len();
        self.records.retain(|_, r| r.last_seen.elapsed() <= ttl);
        report.expired_candidates = before - self.records.len();

        let snapshot = self.store.snapshot();
        let victims = self.evictor.select_victims(&snapshot, unix_millis());
        let keys: Vec<TrivariateKey> = victims.iter().map(|v| v.key).collect();
        self.store.remove_many(&keys);

        for victim in &victims {
            match victim.reason {
                EvictionReason::Stale => report.stale_evicted += 1,
                EvictionReason::Capacity => report.capacity_evicted += 1,
            }
            if let Some(archive) = self.archive.as_mut() {
                if let Err(e) = archive.delete(&victim.key).await {
                    error!(key = %victim.key, error = %e, "Failed to delete archived entry");
                }
            }
        }

        for entry in &snapshot {
            entry.reset_window();
        }

        self.metrics.record_evictions("stale", report.stale_evicted);
        self.metrics.record_evictions("capacity", report.capacity_evicted);
        self.metrics.set_pending_promotions(self.records.len());
        self.update_gauges();

        if !victims.is_empty() || report.expired_candidates > 0 {
            info!(
                stale = report.stale_evicted,
                capacity = report.capacity_evicted,
                expired_candidates = report.expired_candidates,
                "Eviction sweep complete"
            );
        }
        report
    }

    async fn invalidate(&mut self, key: TrivariateKey) -> bool {
        self.records.remove(&key);
        let removed = self.store.invalidate(&key).is_some();
        if removed {
            if let Some(archive) = self.archive.as_mut() {
                if let Err(e) = archive.delete(&key).await {
                    error!(key = %key, error = %e, "Failed to delete archived entry");
                }
            }
            self.update_gauges();
            info!(key = %key, "Invalidated entry");
        }
        removed
    }

    fn update_gauges(&self) {
        let entries = self.store.len();
        self.metrics
            .set_cas_entries(entries, self.keys.collision_probability(entries as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(config: Config) -> (Arc<ContentStore>, Arc<Metrics>, CasWriter) {
        let store = Arc::new(ContentStore::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager =
            PromotionManager::new(Arc::clone(&store), &config, Arc::clone(&metrics), None);
        let (writer, _handle) = manager.spawn();
        (store, metrics, writer)
    }

    fn observation(confidence: f64) -> Observation {
        let engine = KeyEngine::new();
        Observation {
            key: engine.derive(b"query", b"ctx", b"id"),
            fingerprint: engine.fingerprint(b"query"),
            answer: Record::from_value(json!({"schema": "answer", "fields": {"count": 1}}))
                .unwrap(),
            confidence,
            tier: Tier::C,
        }
    }

    #[tokio::test]
    async fn test_promotes_after_threshold() {
        let (store, metrics, writer) = setup(Config::default());
        let obs = observation(0.95);

        assert_eq!(writer.observe(obs.clone()).await.unwrap(), Decision::Pending);
        assert_eq!(writer.observe(obs.clone()).await.unwrap(), Decision::Pending);
        assert!(!store.contains(&obs.key));
        assert_eq!(writer.observe(obs.clone()).await.unwrap(), Decision::Promoted);

        let entry = store.get_answer(&obs.key, obs.fingerprint).unwrap().unwrap();
        assert_eq!(entry.origin, Origin::Promoted(Tier::C));
        assert_eq!(store.expand(&obs.key).unwrap(), obs.answer);
        assert_eq!(metrics.promotions(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_rejected() {
        let (store, _metrics, writer) = setup(Config::default());
        let obs = observation(0.5);
        for _ in 0..2 {
            writer.observe(obs.clone()).await.unwrap();
        }
        assert_eq!(
            writer.observe(obs.clone()).await.unwrap(),
            Decision::Rejected(RejectReason::LowConfidence)
        );
        assert!(!store.contains(&obs.key));

        // A later confident result for the same key is promoted.
        assert_eq!(writer.observe(observation(0.9)).await.unwrap(), Decision::Promoted);
    }

    #[tokio::test]
    async fn test_pending_records_bounded() {
        let mut config = Config::default();
        config.promotion.max_pending = 1;
        config.promotion.frequency_threshold = 2;
        let (store, _metrics, writer) = setup(config);

        let first = observation(0.95);
        let mut second = observation(0.95);
        second.key.identity ^= 1;

        writer.observe(first.clone()).await.unwrap();
        writer.observe(second).await.unwrap();
        // The first record was dropped, so this starts over.
        assert_eq!(writer.observe(first.clone()).await.unwrap(), Decision::Pending);
        assert!(!store.contains(&first.key));
    }

    #[tokio::test]
    async fn test_invalidate_and_flush() {
        let mut config = Config::default();
        config.promotion.frequency_threshold = 1;
        let (store, _metrics, writer) = setup(config);
        let obs = observation(0.95);
        writer.observe(obs.clone()).await.unwrap();
        assert!(store.contains(&obs.key));

        assert!(writer.invalidate(obs.key).await.unwrap());
        assert!(!writer.invalidate(obs.key).await.unwrap());
        writer.flush().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_candidates() {
        let mut config = Config::default();
        config.promotion.candidate_ttl_secs = 0;
        let (_store, _metrics, writer) = setup(config);
        let obs = observation(0.95);

        assert_eq!(writer.observe(obs.clone()).await.unwrap(), Decision::Pending);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = writer.sweep().await.unwrap();
        assert_eq!(report.expired_candidates, 1);

        // The count starts over after expiry.
        assert_eq!(writer.observe(obs.clone()).await.unwrap(), Decision::Pending);
        assert_eq!(writer.observe(obs).await.unwrap(), Decision::Pending);
    }
}
