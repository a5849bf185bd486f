//! Eviction policy: decides which Tier A entries to drop.
//!
//! Two rules, applied in order:
//! - Stale: promoted entries older than the TTL whose hit count over the
//!   trailing window is below the minimum, least recently used first.
//! - Capacity: when promoted entries exceed the high watermark, the least
//!   recently used are dropped until the count is at the low watermark.
//!
//! Ingested records are never evicted.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::entry::CacheEntry;
use crate::config::EvictionConfig;
use crate::keys::TrivariateKey;

/// Why an entry was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Stale,
    Capacity,
}

/// An eviction candidate with its priority.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: TrivariateKey,
    /// Time since last access; the longest idle is evicted first.
    pub idle_ms: u64,
    pub reason: EvictionReason,
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap on idle time; equal idle times fall back to the key so selection is deterministic.
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.idle_ms
            .cmp(&other.idle_ms)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// The eviction policy engine.
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Whether an entry meets the stale rule at `now_ms`.
    pub fn is_stale(&self, entry: &CacheEntry, now_ms: u64) -> bool {
        entry.origin.is_promoted()
            && entry.age_ms(now_ms) > self.config.ttl_secs.saturating_mul(1000)
            && entry.window_hits() < self.config.min_window_hits
    }

    /// Select entries to evict at `now_ms`, stale ones first.
    pub fn select_victims(
        &self,
        entries: &[Arc<CacheEntry>],
        now_ms: u64,
    ) -> Vec<EvictionCandidate> {
        let mut stale = BinaryHeap::new();
        let mut promoted = 0usize;
        for entry in entries.iter().filter(|e| e.origin.is_promoted()) {
            promoted += 1;
            if self.is_stale(entry, now_ms) {
                stale.push(EvictionCandidate {
                    key: entry.key,
                    idle_ms: entry.idle_ms(now_ms),
                    reason: EvictionReason::Stale,
                });
            }
        }

        let mut victims = Vec::new();
        while victims.len() < self.config.max_evictions_per_sweep {
            match stale.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }

        let remaining = promoted - victims.len();
        let high = (self.config.high_watermark * self.config.max_entries as f64) as usize;
        if remaining > high {
            let low = (self.config.low_watermark * self.config.max_entries as f64) as usize;
            let chosen: HashSet<TrivariateKey> = victims.iter().map(|v| v.key).collect();
            let mut heap: BinaryHeap<EvictionCandidate> = entries
                .iter()
                .filter(|e| e.origin.is_promoted() && !chosen.contains(&e.key))
                .map(|e| EvictionCandidate {
                    key: e.key,
                    idle_ms: e.idle_ms(now_ms),
                    reason: EvictionReason::Capacity,
                })
                .collect();
            for _ in 0..remaining.saturating_sub(low) {
                match heap.pop() {
                    Some(candidate) => victims.push(candidate),
                    None => break,
                }
            }
        }

        victims
    }
}
