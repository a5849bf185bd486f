//! Content-addressable store.
//!
//! Maps trivariate keys to compact payloads. Reads take a shared lock and
//! clone an `Arc<CacheEntry>`; writes replace whole entries under the
//! exclusive lock, so a reader sees either the old or the new entry for a
//! key and never a partial one. Inserts and removals are issued by the
//! single writer task (see [`crate::cache::promoter`]).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::cache::entry::{CacheEntry, Origin};
use crate::keys::{Fingerprint, TrivariateKey};
use crate::staging::{Record, Stage, StagedRepresentation, StagedSerializer};

#[derive(Error, Debug, Clone)]
pub enum CasError {
    #[error("Key collision at {key}: stored content fingerprint differs")]
    KeyCollision { key: TrivariateKey },

    #[error("Expansion failed for {key}: {reason}")]
    ExpansionFailed { key: TrivariateKey, reason: String },

    #[error("Key not found: {0}")]
    NotFound(TrivariateKey),

    #[error("CAS writer is not running")]
    WriterClosed,
}

/// Result of a successful put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Inserted,
    AlreadyExists,
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

/// Store-wide statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CasStats {
    pub entries: usize,
    pub ingested: usize,
    pub promoted: usize,
    pub payload_bytes: usize,
    pub total_hits: u64,
}

/// The content-addressable store.
pub struct ContentStore {
    entries: RwLock<HashMap<TrivariateKey, Arc<CacheEntry>>>,
    serializer: StagedSerializer,
}

impl ContentStore {
    pub fn new(serializer: StagedSerializer) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            serializer,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TrivariateKey, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TrivariateKey, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an entry.
    ///
    /// A second put for a key with the same fingerprint and payload collapses
    /// to `AlreadyExists`; anything else under the same key is a collision
    /// and leaves the stored entry untouched.
    pub fn put(&self, entry: CacheEntry) -> Result<PutOutcome, CasError> {
        let mut entries = self.write();
        if let Some(existing) = entries.get(&entry.key) {
            if existing.fingerprint == entry.fingerprint && existing.checksum == entry.checksum {
                return Ok(PutOutcome::AlreadyExists);
            }
            warn!(key = %entry.key, "Fingerprint or payload mismatch on put");
            return Err(CasError::KeyCollision { key: entry.key });
        }
        debug!(
            key = %entry.key,
            size = entry.payload.len(),
            origin = ?entry.origin,
            "Stored entry"
        );
        entries.insert(entry.key, Arc::new(entry));
        Ok(PutOutcome::Inserted)
    }

    /// Look up a payload and record the hit.
    pub fn get(&self, key: &TrivariateKey) -> Lookup {
        match self.read().get(key) {
            Some(entry) => {
                entry.touch();
                Lookup::Hit(entry.payload.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Look up a payload, refusing it if the stored fingerprint is not the
    /// caller's.
    pub fn get_verified(
        &self,
        key: &TrivariateKey,
        fingerprint: Fingerprint,
    ) -> Result<Lookup, CasError> {
        match self.entry_verified(key, fingerprint)? {
            Some(entry) => {
                entry.touch();
                Ok(Lookup::Hit(entry.payload.clone()))
            }
            None => Ok(Lookup::Miss),
        }
    }

    /// Tier A lookup: only promoted answers are served, and the hit is recorded.
    pub fn get_answer(
        &self,
        key: &TrivariateKey,
        fingerprint: Fingerprint,
    ) -> Result<Option<Arc<CacheEntry>>, CasError> {
        let entry = self
            .entry_verified(key, fingerprint)?
            .filter(|entry| entry.origin.is_promoted());
        if let Some(entry) = &entry {
            entry.touch();
        }
        Ok(entry)
    }

    fn entry_verified(
        &self,
        key: &TrivariateKey,
        fingerprint: Fingerprint,
    ) -> Result<Option<Arc<CacheEntry>>, CasError> {
        match self.read().get(key) {
            Some(entry) if entry.fingerprint != fingerprint => {
                warn!(key = %key, "Fingerprint mismatch on get");
                Err(CasError::KeyCollision { key: *key })
            }
            Some(entry) => Ok(Some(Arc::clone(entry))),
            None => Ok(None),
        }
    }

    /// Entry snapshot without recording a hit.
    pub fn peek(&self, key: &TrivariateKey) -> Option<Arc<CacheEntry>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &TrivariateKey) -> bool {
        self.read().contains_key(key)
    }

    /// Re-expand the stored payload into the record it was staged from.
    ///
    /// Every decoded stage is checked against the stored chain. Does not
    /// touch access counters.
    pub fn expand(&self, key: &TrivariateKey) -> Result<Record, CasError> {
        let entry = self.peek(key).ok_or(CasError::NotFound(*key))?;
        self.expand_entry(&entry).inspect_err(|e| {
            error!(key = %key, error = %e, "Expansion failed");
        })
    }

    fn expand_entry(&self, entry: &CacheEntry) -> Result<Record, CasError> {
        let failed = |reason: String| CasError::ExpansionFailed {
            key: entry.key,
            reason,
        };

        let chain = entry
            .chain
            .as_ref()
            .ok_or_else(|| failed("no staged chain".to_string()))?;

        if entry.payload.len() != chain.stage_sizes[Stage::Compact.index()] {
            return Err(failed(format!(
                "compact payload is {} bytes, chain records {}",
                entry.payload.len(),
                chain.stage_sizes[Stage::Compact.index()]
            )));
        }
        if entry.payload.first() != Some(&chain.dictionary_version) {
            return Err(failed("dictionary version does not match chain".to_string()));
        }

        let mut current = StagedRepresentation::new(Stage::Compact, entry.payload.clone());
        while let Some(previous) = current.stage.previous() {
            current = self
                .serializer
                .decode(&current, previous)
                .map_err(|e| failed(e.to_string()))?;
            let expected = chain.stage_sizes[previous.index()];
            if current.size() != expected {
                return Err(failed(format!(
                    "{previous} stage is {} bytes, chain records {expected}",
                    current.size()
                )));
            }
        }

        if xxh3_64(&current.bytes) != chain.structured_checksum {
            return Err(failed("structured checksum mismatch".to_string()));
        }
        Record::from_canonical(&current.bytes).map_err(|e| failed(e.to_string()))
    }

    /// Remove an entry.
    pub fn invalidate(&self, key: &TrivariateKey) -> Option<Arc<CacheEntry>> {
        self.write().remove(key)
    }

    /// Remove several entries at once.
    pub fn remove_many(&self, keys: &[TrivariateKey]) -> Vec<Arc<CacheEntry>> {
        let mut entries = self.write();
        keys.iter().filter_map(|key| entries.remove(key)).collect()
    }

    /// Snapshot of every entry.
    pub fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> CasStats {
        let entries = self.read();
        let mut stats = CasStats {
            entries: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.origin {
                Origin::Ingested => stats.ingested += 1,
                Origin::Promoted(_) => stats.promoted += 1,
            }
            stats.payload_bytes += entry.payload.len();
            stats.total_hits += entry.hit_count();
        }
        stats
    }

    pub fn serializer(&self) -> &StagedSerializer {
        &self.serializer
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new(StagedSerializer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Tier;
    use crate::keys::KeyEngine;
    use serde_json::json;

    fn staged_entry(store: &ContentStore, origin: Origin) -> (CacheEntry, Record) {
        let record = Record::from_value(json!({
            "schema": "task",
            "fields": {"name": "Recon", "priority": "high"}
        }))
        .unwrap();
        let staged = store.serializer().encode(&record).unwrap();
        let payload = staged.compact().bytes.clone();
        let engine = KeyEngine::new();
        let key = engine.derive(&payload, b"ops|0", b"task-1");
        let entry = CacheEntry::new(
            key,
            payload.clone(),
            engine.fingerprint(&payload),
            Some(staged.chain),
            origin,
            1.0,
        );
        (entry, record)
    }

    #[test]
    fn test_put_get_expand() {
        let store = ContentStore::default();
        let (entry, record) = staged_entry(&store, Origin::Ingested);
        let key = entry.key;

        assert_eq!(store.get(&key), Lookup::Miss);
        assert_eq!(store.put(entry).unwrap(), PutOutcome::Inserted);

        match store.get(&key) {
            Lookup::Hit(payload) => assert_eq!(payload.len(), 16),
            Lookup::Miss => panic!("expected hit"),
        }
        assert_eq!(store.expand(&key).unwrap(), record);
        // Expansion is idempotent and does not count as a hit.
        assert_eq!(store.expand(&key).unwrap(), record);
        assert_eq!(store.peek(&key).unwrap().hit_count(), 1);
    }

    #[test]
    fn test_duplicate_put_collapses() {
        let store = ContentStore::default();
        let (a, _) = staged_entry(&store, Origin::Ingested);
        let (b, _) = staged_entry(&store, Origin::Ingested);
        assert_eq!(store.put(a).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(b).unwrap(), PutOutcome::AlreadyExists);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_fingerprint_mismatch_is_collision() {
        let store = ContentStore::default();
        let (entry, _) = staged_entry(&store, Origin::Promoted(Tier::C));
        let key = entry.key;
        let good = entry.fingerprint;
        store.put(entry).unwrap();

        let forged = Fingerprint(good.0 ^ 1);
        assert!(matches!(
            store.get_verified(&key, forged),
            Err(CasError::KeyCollision { .. })
        ));
        assert!(matches!(
            store.get_answer(&key, forged),
            Err(CasError::KeyCollision { .. })
        ));
        assert!(store.get_verified(&key, good).unwrap().is_hit());
    }

    #[test]
    fn test_same_fingerprint_different_payload_is_collision() {
        let store = ContentStore::default();
        let (entry, record) = staged_entry(&store, Origin::Ingested);
        let key = entry.key;
        let fingerprint = entry.fingerprint;
        store.put(entry).unwrap();

        let other =
            Record::from_value(json!({"schema": "answer", "fields": {"count": 1}})).unwrap();
        let staged = store.serializer().encode(&other).unwrap();
        let imposter = CacheEntry::new(
            key,
            staged.compact().bytes.clone(),
            fingerprint,
            Some(staged.chain),
            Origin::Promoted(Tier::C),
            0.9,
        );
        assert!(matches!(store.put(imposter), Err(CasError::KeyCollision { .. })));
        assert_eq!(store.expand(&key).unwrap(), record);
    }

    #[test]
    fn test_get_answer_skips_ingested() {
        let store = ContentStore::default();
        let (entry, _) = staged_entry(&store, Origin::Ingested);
        let key = entry.key;
        let fp = entry.fingerprint;
        store.put(entry).unwrap();
        assert!(store.get_answer(&key, fp).unwrap().is_none());
    }

    #[test]
    fn test_expand_without_chain_fails() {
        let store = ContentStore::default();
        let (mut entry, _) = staged_entry(&store, Origin::Ingested);
        entry.chain = None;
        let key = entry.key;
        store.put(entry).unwrap();
        assert!(matches!(
            store.expand(&key),
            Err(CasError::ExpansionFailed { .. })
        ));
    }

    #[test]
    fn test_expand_detects_corrupted_chain() {
        let store = ContentStore::default();
        let (mut entry, _) = staged_entry(&store, Origin::Ingested);
        if let Some(chain) = entry.chain.as_mut() {
            chain.structured_checksum ^= 1;
        }
        let key = entry.key;
        store.put(entry).unwrap();
        assert!(matches!(
            store.expand(&key),
            Err(CasError::ExpansionFailed { .. })
        ));
    }

    #[test]
    fn test_expand_missing_key() {
        let store = ContentStore::default();
        let key = KeyEngine::new().derive(b"a", b"b", b"c");
        assert!(matches!(store.expand(&key), Err(CasError::NotFound(_))));
    }

    #[test]
    fn test_stats_and_invalidate() {
        let store = ContentStore::default();
        let (entry, _) = staged_entry(&store, Origin::Ingested);
        let key = entry.key;
        store.put(entry).unwrap();
        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.ingested, 1);
        assert_eq!(stats.payload_bytes, 16);

        assert!(store.invalidate(&key).is_some());
        assert!(store.is_empty());
        assert!(store.invalidate(&key).is_none());
    }
}
