use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{NodeId, TrustLevel};

/// Score bands that map accumulated reputation onto trust levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustThresholds {
    /// Minimum score for `Trusted`
    pub trusted_min: i32,
    /// Minimum score for `Verified`
    pub verified_min: i32,
    /// Scores below this are `Suspicious`
    pub suspicious_below: i32,
    /// Scores below this are `Banned`
    pub banned_below: i32,
}

impl Default for TrustThresholds {
    fn default() -> Self {
        Self {
            trusted_min: 60,
            verified_min: 85,
            suspicious_below: 30,
            banned_below: 10,
        }
    }
}

/// Bounds and thresholds applied by the persistence layer when a delta lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationPolicy {
    pub min_score: i32,
    pub max_score: i32,
    pub initial_score: i32,
    pub thresholds: TrustThresholds,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            min_score: 0,
            max_score: 100,
            initial_score: 50,
            thresholds: TrustThresholds::default(),
        }
    }
}

impl ReputationPolicy {
    pub fn clamp(&self, score: i64) -> i32 {
        score.clamp(i64::from(self.min_score), i64::from(self.max_score)) as i32
    }

    /// Trust level for `score`, given the level the node currently holds.
    ///
    /// `Banned` is sticky: lifting a ban is left to external review.
    pub fn evaluate(&self, score: i32, current: TrustLevel) -> TrustLevel {
        let t = &self.thresholds;
        if current == TrustLevel::Banned {
            return TrustLevel::Banned;
        }
        if score < t.banned_below {
            TrustLevel::Banned
        } else if score < t.suspicious_below {
            TrustLevel::Suspicious
        } else if score >= t.verified_min {
            TrustLevel::Verified
        } else if score >= t.trusted_min {
            TrustLevel::Trusted
        } else {
            match current {
                TrustLevel::Verified => TrustLevel::Trusted,
                other => other,
            }
        }
    }
}

/// One signed delta in a node's reputation ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub node_id: NodeId,
    pub event_type: String,
    pub delta: i32,
    pub description: String,
    pub score_after: i32,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_policy_bounds() {
        let policy = ReputationPolicy::default();
        assert_eq!(policy.clamp(-40), 0);
        assert_eq!(policy.clamp(250), 100);
        assert_eq!(policy.clamp(42), 42);
    }

    #[test]
    fn score_bands_map_to_trust_levels() {
        let policy = ReputationPolicy::default();
        assert_eq!(policy.evaluate(50, TrustLevel::New), TrustLevel::New);
        assert_eq!(policy.evaluate(65, TrustLevel::New), TrustLevel::Trusted);
        assert_eq!(policy.evaluate(90, TrustLevel::Trusted), TrustLevel::Verified);
        assert_eq!(policy.evaluate(70, TrustLevel::Verified), TrustLevel::Trusted);
        assert_eq!(policy.evaluate(20, TrustLevel::Trusted), TrustLevel::Suspicious);
        assert_eq!(policy.evaluate(5, TrustLevel::Suspicious), TrustLevel::Banned);
    }

    #[test]
    fn ban_is_sticky() {
        let policy = ReputationPolicy::default();
        assert_eq!(policy.evaluate(95, TrustLevel::Banned), TrustLevel::Banned);
    }

    #[test]
    fn suspicious_stays_suspicious_in_middle_band() {
        let policy = ReputationPolicy::default();
        assert_eq!(
            policy.evaluate(45, TrustLevel::Suspicious),
            TrustLevel::Suspicious
        );
    }
}
