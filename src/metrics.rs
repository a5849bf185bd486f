//! Prometheus metrics.
//!
//! # Metric Naming Convention
//! - `cas_router_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `tier`: A, B, C
//! - `stage`: structured, symbolic, compact
//! - `outcome`: hit, miss, success, failure
//!
//! Each [`Metrics`] owns its registry so independent instances (tests,
//! embedded routers) never collide.

use std::time::Duration;

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::cache::entry::Tier;
use crate::staging::{Stage, StagedChain};

pub struct Metrics {
    registry: Registry,
    tier_requests: IntCounterVec,
    request_latency: HistogramVec,
    promotions: IntCounter,
    promotion_rejections: IntCounterVec,
    evictions: IntCounterVec,
    key_collisions: IntCounter,
    tier_c_retries: IntCounter,
    stage_ratio: HistogramVec,
    stage_bytes: HistogramVec,
    cas_entries: IntGauge,
    pending_promotions: IntGauge,
    collision_probability: Gauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tier_requests = IntCounterVec::new(
            Opts::new("cas_router_tier_requests_total", "Tier attempts by outcome"),
            &["tier", "outcome"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("cas_router_request_seconds", "Request latency by resolving tier")
                .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["tier"],
        )?;
        let promotions =
            IntCounter::new("cas_router_promotions_total", "Results promoted into Tier A")?;
        let promotion_rejections = IntCounterVec::new(
            Opts::new("cas_router_promotion_rejections_total", "Promotion attempts rejected"),
            &["reason"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("cas_router_evictions_total", "Tier A entries evicted"),
            &["reason"],
        )?;
        let key_collisions = IntCounter::new(
            "cas_router_key_collisions_total",
            "Fingerprint mismatches detected",
        )?;
        let tier_c_retries = IntCounter::new(
            "cas_router_tier_c_retries_total",
            "Tier C attempts after the first",
        )?;
        let stage_ratio = HistogramVec::new(
            HistogramOpts::new(
                "cas_router_stage_ratio",
                "Stage size relative to the previous stage",
            )
                .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
            &["stage"],
        )?;
        let stage_bytes = HistogramVec::new(
            HistogramOpts::new("cas_router_stage_bytes", "Encoded size per stage")
                .buckets(prometheus::exponential_buckets(8.0, 2.0, 12)?),
            &["stage"],
        )?;
        let cas_entries = IntGauge::new("cas_router_cas_entries", "Entries in the content store")?;
        let pending_promotions = IntGauge::new(
            "cas_router_pending_promotions",
            "Promotion records awaiting a decision",
        )?;
        let collision_probability = Gauge::new(
            "cas_router_collision_probability",
            "Birthday bound on a content-part collision at the current entry count",
        )?;

        registry.register(Box::new(tier_requests.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(promotions.clone()))?;
        registry.register(Box::new(promotion_rejections.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(key_collisions.clone()))?;
        registry.register(Box::new(tier_c_retries.clone()))?;
        registry.register(Box::new(stage_ratio.clone()))?;
        registry.register(Box::new(stage_bytes.clone()))?;
        registry.register(Box::new(cas_entries.clone()))?;
        registry.register(Box::new(pending_promotions.clone()))?;
        registry.register(Box::new(collision_probability.clone()))?;

        Ok(Self {
            registry,
            tier_requests,
            request_latency,
            promotions,
            promotion_rejections,
            evictions,
            key_collisions,
            tier_c_retries,
            stage_ratio,
            stage_bytes,
            cas_entries,
            pending_promotions,
            collision_probability,
        })
    }

    pub fn record_tier(&self, tier: Tier, outcome: &str) {
        self.tier_requests
            .with_label_values(&[tier.as_str(), outcome])
            .inc();
    }

    pub fn tier_count(&self, tier: Tier, outcome: &str) -> u64 {
        self.tier_requests
            .with_label_values(&[tier.as_str(), outcome])
            .get()
    }

    pub fn record_latency(&self, tier: Tier, elapsed: Duration) {
        self.request_latency
            .with_label_values(&[tier.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_promotion(&self) {
        self.promotions.inc();
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.get()
    }

    pub fn record_rejection(&self, reason: &str) {
        self.promotion_rejections.with_label_values(&[reason]).inc();
    }

    pub fn record_evictions(&self, reason: &str, count: usize) {
        self.evictions
            .with_label_values(&[reason])
            .inc_by(count as u64);
    }

    pub fn evictions(&self, reason: &str) -> u64 {
        self.evictions.with_label_values(&[reason]).get()
    }

    pub fn record_collision(&self) {
        self.key_collisions.inc();
    }

    pub fn record_retry(&self) {
        self.tier_c_retries.inc();
    }

    /// Record per-stage sizes and ratios of one encoding.
    pub fn record_staging(&self, chain: &StagedChain) {
        for stage in Stage::ALL {
            self.stage_bytes
                .with_label_values(&[stage.to_string().as_str()])
                .observe(chain.stage_sizes[stage.index()] as f64);
        }
        let ratios = chain.ratios();
        self.stage_ratio
            .with_label_values(&[Stage::Symbolic.to_string().as_str()])
            .observe(ratios[0]);
        self.stage_ratio
            .with_label_values(&[Stage::Compact.to_string().as_str()])
            .observe(ratios[1]);
    }

    pub fn set_cas_entries(&self, entries: usize, collision_probability: f64) {
        self.cas_entries.set(entries as i64);
        self.collision_probability.set(collision_probability);
    }

    pub fn set_pending_promotions(&self, pending: usize) {
        self.pending_promotions.set(pending as i64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_tier(Tier::A, "hit");
        metrics.record_promotion();
        metrics.record_staging(&StagedChain {
            dictionary_version: 1,
            stage_sizes: [61, 31, 16],
            structured_checksum: 0,
        });

        let text = metrics.render();
        assert!(text.contains("cas_router_tier_requests_total{outcome=\"hit\",tier=\"A\"} 1"));
        assert!(text.contains("cas_router_promotions_total 1"));
        assert!(text.contains("cas_router_stage_bytes_bucket"));
        assert_eq!(metrics.tier_count(Tier::A, "hit"), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_promotion();
        assert_eq!(a.promotions(), 1);
        assert_eq!(b.promotions(), 0);
    }
}
