//! Viral score over engagement counters.
//!
//! `score = 10 * log10(1 + likes + 2 * replies + 3 * shares)`
//!
//! Replies and shares weigh more than likes because they spread a post beyond
//! the author's followers. The log keeps scores in a readable range: the
//! default threshold of 20 corresponds to a weighted engagement above 99.

use crate::model::EngagementMetrics;

pub const LIKE_WEIGHT: f64 = 1.0;
pub const REPLY_WEIGHT: f64 = 2.0;
pub const SHARE_WEIGHT: f64 = 3.0;

/// Default qualifying threshold (strictly greater than).
pub const DEFAULT_THRESHOLD: f64 = 20.0;

/// Total, monotonic, never negative.
pub fn viral_score(metrics: &EngagementMetrics) -> f64 {
    let weighted = LIKE_WEIGHT * metrics.like_count as f64
        + REPLY_WEIGHT * metrics.reply_count as f64
        + SHARE_WEIGHT * metrics.share_count as f64;
    10.0 * (1.0 + weighted).log10()
}

pub fn qualifies(score: f64, threshold: f64) -> bool {
    score > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_engagement_scores_zero() {
        assert_eq!(viral_score(&EngagementMetrics::default()), 0.0);
    }

    #[test]
    fn reference_thread_qualifies() {
        let s = viral_score(&EngagementMetrics::new(150, 45, 23));
        assert!(s > 24.0 && s < 25.0, "score was {s}");
        assert!(qualifies(s, DEFAULT_THRESHOLD));
    }

    #[test]
    fn threshold_is_strict() {
        // weighted engagement of exactly 99 gives exactly 20
        let s = viral_score(&EngagementMetrics::new(99, 0, 0));
        assert!((s - 20.0).abs() < 1e-9);
        assert!(!qualifies(20.0, DEFAULT_THRESHOLD));
    }

    #[test]
    fn monotonic_in_each_component() {
        let samples = [0u64, 1, 2, 7, 50, 99, 100, 1_000, 123_456, u32::MAX as u64];
        for &a in &samples {
            for &b in &samples {
                for &c in &samples {
                    let base = viral_score(&EngagementMetrics::new(a, b, c));
                    assert!(viral_score(&EngagementMetrics::new(a + 1, b, c)) >= base);
                    assert!(viral_score(&EngagementMetrics::new(a, b + 1, c)) >= base);
                    assert!(viral_score(&EngagementMetrics::new(a, b, c + 1)) >= base);
                }
            }
        }
    }

    #[test]
    fn extreme_counters_stay_finite() {
        let s = viral_score(&EngagementMetrics::new(u64::MAX, u64::MAX, u64::MAX));
        assert!(s.is_finite());
        assert!(s > 0.0);
    }
}
