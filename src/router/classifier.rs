//! Complexity classifier.
//!
//! Scores a request in [0, 1] from cheap shape features and maps the score
//! to the cheapest tier allowed to answer it:
//!
//! ```text
//! score <  t_A          → A first (B allowed on a miss)
//! t_A <= score <  t_B   → B allowed
//! score >= t_B          → C required
//! ```

use serde::Serialize;

use crate::cache::entry::Tier;
use crate::config::ClassifierConfig;
use crate::staging::Record;

/// Bounded-cost request features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestFeatures {
    /// Canonical size in bytes.
    pub size: usize,
    pub depth: usize,
    pub fan_out: usize,
    /// Whether Tier A already holds an answer under the request key.
    pub tier_a_match: bool,
}

impl RequestFeatures {
    pub fn of(query: &Record, tier_a_match: bool) -> Self {
        Self {
            size: query.byte_size(),
            depth: query.depth(),
            fan_out: query.fan_out(),
            tier_a_match,
        }
    }
}

/// A score and the tier it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub score: f64,
    pub tier: Tier,
}

impl Classification {
    /// Whether Tier B may be tried after a Tier A miss.
    pub fn allows_tier_b(&self) -> bool {
        self.tier <= Tier::B
    }
}

pub struct ComplexityClassifier {
    config: ClassifierConfig,
}

impl ComplexityClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Complexity score in [0, 1].
    pub fn score(&self, features: &RequestFeatures) -> f64 {
        if features.tier_a_match {
            return 0.0;
        }
        if features.size > self.config.tier_b_max_bytes {
            return 1.0;
        }

        let ratio = |value: usize, saturation: usize| {
            if saturation == 0 {
                1.0
            } else {
                (value as f64 / saturation as f64).min(1.0)
            }
        };
        let c = &self.config;
        let total_weight = c.size_weight + c.depth_weight + c.fan_out_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }
        let weighted = c.size_weight * ratio(features.size, c.tier_b_max_bytes)
            + c.depth_weight * ratio(features.depth, c.depth_saturation)
            + c.fan_out_weight * ratio(features.fan_out, c.fan_out_saturation);
        (weighted / total_weight).clamp(0.0, 1.0)
    }

    pub fn tier_for(&self, score: f64) -> Tier {
        if score < self.config.tier_a_threshold {
            Tier::A
        } else if score < self.config.tier_b_threshold {
            Tier::B
        } else {
            Tier::C
        }
    }

    pub fn classify(&self, features: &RequestFeatures) -> Classification {
        let score = self.score(features);
        Classification {
            score,
            tier: self.tier_for(score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(size: usize, depth: usize, fan_out: usize) -> RequestFeatures {
        RequestFeatures {
            size,
            depth,
            fan_out,
            tier_a_match: false,
        }
    }

    #[test]
    fn test_small_flat_request_is_cheap() {
        let classifier = ComplexityClassifier::new(ClassifierConfig::default());
        let c = classifier.classify(&features(61, 1, 2));
        assert!(c.score < 0.1, "score {}", c.score);
        assert_eq!(c.tier, Tier::A);
        assert!(c.allows_tier_b());
    }

    #[test]
    fn test_tier_a_match_scores_zero() {
        let classifier = ComplexityClassifier::new(ClassifierConfig::default());
        let mut f = features(4000, 6, 64);
        f.tier_a_match = true;
        assert_eq!(classifier.score(&f), 0.0);
    }

    #[test]
    fn test_oversized_requires_tier_c() {
        let classifier = ComplexityClassifier::new(ClassifierConfig::default());
        let c = classifier.classify(&features(5000, 1, 1));
        assert_eq!(c.score, 1.0);
        assert_eq!(c.tier, Tier::C);
        assert!(!c.allows_tier_b());
    }

    #[test]
    fn test_score_is_monotonic_in_features() {
        let classifier = ComplexityClassifier::new(ClassifierConfig::default());
        let small = classifier.score(&features(100, 1, 4));
        let deeper = classifier.score(&features(100, 4, 4));
        let wider = classifier.score(&features(100, 4, 40));
        assert!(small < deeper && deeper < wider);
        assert!(wider <= 1.0);
    }

    #[test]
    fn test_thresholds_are_configuration() {
        let classifier = ComplexityClassifier::new(ClassifierConfig {
            tier_a_threshold: 0.0,
            tier_b_threshold: 0.0,
            ..Default::default()
        });
        assert_eq!(classifier.classify(&features(61, 1, 2)).tier, Tier::C);
    }
}
