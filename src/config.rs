//! Runtime configuration for cas-tier-router.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All routing knobs (tier thresholds, timeouts, promotion hysteresis, eviction
//! windows) live here so they can be tuned without code changes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Upper bound on Tier C attempts, including the first.
pub const MAX_TIER_C_ATTEMPTS: u32 = 3;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cas-tier-router",
    about = "Hash-addressed staged store with a tiered execution router"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Staged serializer settings.
    pub staging: StagingConfig,

    /// Key derivation settings.
    pub keys: KeyConfig,

    /// Complexity classifier thresholds and weights.
    pub classifier: ClassifierConfig,

    /// Router timeouts and retry policy.
    pub router: RouterConfig,

    /// Promotion hysteresis.
    pub promotion: PromotionConfig,

    /// Tier A eviction policy.
    pub eviction: EvictionConfig,

    /// Optional on-disk entry archive.
    pub archive: ArchiveConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 256,
            request_timeout_secs: 60,
        }
    }
}

/// Staged serializer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Additional dictionary versions (JSON files) registered next to the built-in one.
    /// The highest version becomes the encoding dictionary.
    pub dictionary_paths: Vec<PathBuf>,
}

/// Key derivation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Width of the context time bucket in seconds.
    pub time_bucket_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            time_bucket_secs: 3600,
        }
    }
}

/// Complexity classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Scores below this go to Tier A first.
    pub tier_a_threshold: f64,

    /// Scores below this (and at least `tier_a_threshold`) may use Tier B.
    pub tier_b_threshold: f64,

    /// Requests larger than this (canonical bytes) always require Tier C.
    pub tier_b_max_bytes: usize,

    /// Weight for request size.
    pub size_weight: f64,

    /// Weight for nesting depth.
    pub depth_weight: f64,

    /// Weight for field fan-out.
    pub fan_out_weight: f64,

    /// Depth at which the depth feature saturates.
    pub depth_saturation: usize,

    /// Fan-out at which the fan-out feature saturates.
    pub fan_out_saturation: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tier_a_threshold: 0.1,
            tier_b_threshold: 0.6,
            tier_b_max_bytes: 4096,
            size_weight: 0.5,
            depth_weight: 0.3,
            fan_out_weight: 0.2,
            depth_saturation: 6,
            fan_out_saturation: 64,
        }
    }
}

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Tier B timeout in milliseconds; on timeout the request escalates to Tier C.
    pub tier_b_timeout_ms: u64,

    /// Minimum Tier B confidence to accept its answer.
    pub tier_b_min_confidence: f64,

    /// Per-attempt Tier C timeout in milliseconds.
    pub tier_c_timeout_ms: u64,

    /// Tier C retry policy.
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tier_b_timeout_ms: 250,
            tier_b_min_confidence: 0.7,
            tier_c_timeout_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn tier_b_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_b_timeout_ms)
    }

    pub fn tier_c_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_c_timeout_ms)
    }
}

/// Exponential backoff for Tier C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Delay cap, in milliseconds.
    pub max_backoff_ms: u64,

    /// Backoff multiplier.
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            factor: 2.0,
        }
    }
}

/// Promotion hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Observations of a key needed before it may be promoted to Tier A.
    pub frequency_threshold: u64,

    /// Minimum confidence of the latest result.
    pub min_confidence: f64,

    /// Maximum pending promotion records; the oldest are dropped beyond this.
    pub max_pending: usize,

    /// Pending records not seen for this long are dropped.
    pub candidate_ttl_secs: u64,

    /// Depth of the single-writer command queue.
    pub queue_depth: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            frequency_threshold: 3,
            min_confidence: 0.8,
            max_pending: 10_000,
            candidate_ttl_secs: 3600,
            queue_depth: 1024,
        }
    }
}

/// Tier A eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Promoted entries older than this are eviction candidates.
    pub ttl_secs: u64,

    /// Candidates with fewer hits than this in the trailing window are evicted.
    pub min_window_hits: u64,

    /// Sweep interval; also the length of the trailing hit window.
    pub sweep_interval_secs: u64,

    /// Cap on rule-based evictions per sweep.
    pub max_evictions_per_sweep: usize,

    /// Capacity of Tier A in entries.
    pub max_entries: usize,

    /// Start capacity eviction when Tier A exceeds this fraction of capacity.
    pub high_watermark: f64,

    /// Stop capacity eviction when Tier A drops below this fraction.
    pub low_watermark: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            min_window_hits: 1,
            sweep_interval_secs: 60,
            max_evictions_per_sweep: 1024,
            max_entries: 100_000,
            high_watermark: 0.90,
            low_watermark: 0.75,
        }
    }
}

impl EvictionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Entry archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory for archived entries; None disables the archive.
    pub path: Option<PathBuf>,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: None,
            zstd_level: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break routing or eviction invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.classifier;
        if !unit_interval(c.tier_a_threshold) || !unit_interval(c.tier_b_threshold) {
            bail!("classifier thresholds must lie in [0, 1]");
        }
        if c.tier_a_threshold > c.tier_b_threshold {
            bail!(
                "tier_a_threshold ({}) must not exceed tier_b_threshold ({})",
                c.tier_a_threshold,
                c.tier_b_threshold
            );
        }

        let r = &self.router;
        if !unit_interval(r.tier_b_min_confidence) {
            bail!("router.tier_b_min_confidence must lie in [0, 1]");
        }
        if r.tier_b_timeout_ms >= r.tier_c_timeout_ms {
            bail!(
                "router.tier_b_timeout_ms ({}) must be below router.tier_c_timeout_ms ({})",
                r.tier_b_timeout_ms,
                r.tier_c_timeout_ms
            );
        }
        if !(1..=MAX_TIER_C_ATTEMPTS).contains(&r.retry.max_attempts) {
            bail!("router.retry.max_attempts must lie in [1, {MAX_TIER_C_ATTEMPTS}]");
        }
        if !r.retry.factor.is_finite() || r.retry.factor < 1.0 {
            bail!("router.retry.factor must be finite and at least 1");
        }
        if r.retry.initial_backoff_ms > r.retry.max_backoff_ms {
            bail!("router.retry.initial_backoff_ms must not exceed max_backoff_ms");
        }

        let p = &self.promotion;
        if p.frequency_threshold == 0 {
            bail!("promotion.frequency_threshold must be at least 1");
        }
        if !unit_interval(p.min_confidence) {
            bail!("promotion.min_confidence must lie in [0, 1]");
        }
        if p.queue_depth == 0 {
            bail!("promotion.queue_depth must be at least 1");
        }

        let e = &self.eviction;
        if !unit_interval(e.low_watermark) || !unit_interval(e.high_watermark) {
            bail!("eviction watermarks must lie in [0, 1]");
        }
        if e.low_watermark > e.high_watermark {
            bail!("eviction.low_watermark must not exceed eviction.high_watermark");
        }
        Ok(())
    }
}

fn unit_interval(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.router.retry.max_attempts, 3);
        assert_eq!(cfg.promotion.frequency_threshold, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"classifier": {"tier_a_threshold": 0.2}}"#).unwrap();
        assert_eq!(cfg.classifier.tier_a_threshold, 0.2);
        assert_eq!(cfg.classifier.tier_b_threshold, 0.6);
        assert_eq!(cfg.eviction.ttl_secs, 3600);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut cfg = Config::default();
        cfg.classifier.tier_a_threshold = 0.9;
        cfg.classifier.tier_b_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/cas-tier-router.json")).unwrap();
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_validate_bounds_retry_attempts() {
        let mut cfg = Config::default();
        cfg.router.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
        cfg.router.retry.max_attempts = 10;
        assert!(cfg.validate().is_err());
        cfg.router.retry.max_attempts = MAX_TIER_C_ATTEMPTS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        for factor in [1e300_f64, f64::INFINITY, f64::NAN, 0.5] {
            let mut cfg = Config::default();
            cfg.router.retry.factor = factor;
            assert!(cfg.validate().is_err(), "factor {factor} accepted");
        }
        let mut cfg = Config::default();
        cfg.router.retry.initial_backoff_ms = 5000;
        cfg.router.retry.max_backoff_ms = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let mut cfg = Config::default();
        cfg.router.tier_b_min_confidence = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.promotion.min_confidence = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_watermarks() {
        let mut cfg = Config::default();
        cfg.eviction.high_watermark = 1.2;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.eviction.low_watermark = -0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_tier_b_timeout_below_tier_c() {
        let mut cfg = Config::default();
        cfg.router.tier_b_timeout_ms = cfg.router.tier_c_timeout_ms;
        assert!(cfg.validate().is_err());
    }
}
