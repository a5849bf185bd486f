//! Cache entry types and tier definitions.
//!
//! A cache entry holds one compact payload under its trivariate key. Entries
//! are immutable except for their access counters, which are atomics so that
//! readers can record hits without taking the store's write lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::keys::{Fingerprint, TrivariateKey};
use crate::staging::StagedChain;

/// Execution tier of the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Tier A: exact cached answer.
    A,
    /// Tier B: bounded local computation.
    B,
    /// Tier C: full computation.
    C,
}

impl Tier {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A record stored through the ingestion API.
    Ingested,
    /// An answer promoted into Tier A from the tier that computed it.
    Promoted(Tier),
}

impl Origin {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Origin::Promoted(_))
    }
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One CAS entry.
#[derive(Debug)]
pub struct CacheEntry {
    /// Lookup key.
    pub key: TrivariateKey,

    /// Compact (stage 2) payload.
    pub payload: Bytes,

    /// xxh3 of `payload`; equal keys only collapse onto equal payloads.
    pub checksum: u64,

    /// Checksum of the content that produced the key's content part.
    pub fingerprint: Fingerprint,

    /// Staged chain for re-expansion, if the payload is expandable.
    pub chain: Option<StagedChain>,

    /// Ingested record or promoted answer.
    pub origin: Origin,

    /// Confidence of the result that produced this entry (1.0 for ingested records).
    pub confidence: f64,

    /// Creation time (Unix millis).
    pub created_at_ms: u64,

    /// Hits since creation.
    hit_count: AtomicU64,

    /// Hits since the last eviction sweep.
    window_hits: AtomicU64,

    /// Last access time (Unix millis).
    last_access_ms: AtomicU64,
}

impl CacheEntry {
    pub fn new(
        key: TrivariateKey,
        payload: Bytes,
        fingerprint: Fingerprint,
        chain: Option<StagedChain>,
        origin: Origin,
        confidence: f64,
    ) -> Self {
        let now = unix_millis();
        Self {
            key,
            checksum: xxh3_64(&payload),
            payload,
            fingerprint,
            chain,
            origin,
            confidence,
            created_at_ms: now,
            hit_count: AtomicU64::new(0),
            window_hits: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(now),
        }
    }

    /// Record an access.
    pub fn touch(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.window_hits.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms.fetch_max(unix_millis(), Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn window_hits(&self) -> u64 {
        self.window_hits.load(Ordering::Relaxed)
    }

    /// Start a new trailing hit window.
    pub fn reset_window(&self) {
        self.window_hits.store(0, Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Age at `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// Time since the last access at `now_ms`.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms())
    }

    /// Snapshot for persistence.
    pub fn to_archived(&self) -> ArchivedEntry {
        ArchivedEntry {
            key: self.key,
            payload: self.payload.to_vec(),
            fingerprint: self.fingerprint,
            chain: self.chain.clone(),
            origin: self.origin,
            confidence: self.confidence,
            created_at_ms: self.created_at_ms,
            hit_count: self.hit_count(),
            last_access_ms: self.last_access_ms(),
        }
    }
}

/// Serialized form of a [`CacheEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEntry {
    pub key: TrivariateKey,
    pub payload: Vec<u8>,
    pub fingerprint: Fingerprint,
    pub chain: Option<StagedChain>,
    pub origin: Origin,
    pub confidence: f64,
    pub created_at_ms: u64,
    pub hit_count: u64,
    pub last_access_ms: u64,
}

impl From<ArchivedEntry> for CacheEntry {
    fn from(archived: ArchivedEntry) -> Self {
        Self {
            key: archived.key,
            checksum: xxh3_64(&archived.payload),
            payload: Bytes::from(archived.payload),
            fingerprint: archived.fingerprint,
            chain: archived.chain,
            origin: archived.origin,
            confidence: archived.confidence,
            created_at_ms: archived.created_at_ms,
            hit_count: AtomicU64::new(archived.hit_count),
            window_hits: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(archived.last_access_ms),
        }
    }
}
