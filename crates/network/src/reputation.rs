use meshnet_storage::MeshStore;
use meshnet_types::{generate_id, AbuseReport, AbuseType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::MeshError;
use crate::metrics::MeshMetrics;

/// Reputation deltas applied by the tracker
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub malicious_node_penalty: i32,
    pub security_threat_penalty: i32,
    pub connection_success_delta: i32,
    pub connection_failure_delta: i32,
    /// Nodes kept in the in-memory outcome table; the least recently seen
    /// entry is evicted beyond this
    pub max_tracked_nodes: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            malicious_node_penalty: -20,
            security_threat_penalty: -25,
            connection_success_delta: 1,
            connection_failure_delta: -2,
            max_tracked_nodes: 4096,
        }
    }
}

impl ReputationConfig {
    /// Immediate penalty for a report of `abuse_type`, if it is severe
    pub fn penalty_for(&self, abuse_type: AbuseType) -> Option<i32> {
        match abuse_type {
            AbuseType::MaliciousNode => Some(self.malicious_node_penalty),
            AbuseType::SecurityThreat => Some(self.security_threat_penalty),
            _ => None,
        }
    }
}

/// Per-node outcome counters kept in memory
#[derive(Debug, Clone)]
struct NodeOutcomes {
    successful_connections: u64,
    failed_connections: u64,
    abuse_reports: u64,
    last_seen: Instant,
    first_seen: Instant,
}

impl NodeOutcomes {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            successful_connections: 0,
            failed_connections: 0,
            abuse_reports: 0,
            last_seen: now,
            first_seen: now,
        }
    }
}

/// Records abuse signals and feeds score deltas into the store
pub struct ReputationTracker {
    store: Arc<dyn MeshStore>,
    config: ReputationConfig,
    metrics: Arc<MeshMetrics>,
    outcomes: RwLock<HashMap<String, NodeOutcomes>>,
}

impl ReputationTracker {
    pub fn new(
        store: Arc<dyn MeshStore>,
        config: ReputationConfig,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            outcomes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub fn tracked_nodes(&self) -> usize {
        self.outcomes.read().len()
    }

    fn update_outcomes(&self, node_id: &str, update: impl FnOnce(&mut NodeOutcomes)) {
        let mut outcomes = self.outcomes.write();
        if !outcomes.contains_key(node_id) && outcomes.len() >= self.config.max_tracked_nodes.max(1)
        {
            let oldest = outcomes
                .iter()
                .min_by_key(|(_, o)| o.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                outcomes.remove(&oldest);
                debug!(node_id = %oldest, "Evicted reputation stats");
            }
        }
        let entry = outcomes
            .entry(node_id.to_string())
            .or_insert_with(NodeOutcomes::new);
        entry.last_seen = Instant::now();
        update(entry);
    }

    /// File an abuse report. Severe types also apply their configured
    /// penalty to the reported node right away.
    pub fn report_abuse(
        &self,
        reporter_identity: &str,
        target_node_id: &str,
        abuse_type: AbuseType,
        description: &str,
    ) -> Result<AbuseReport, MeshError> {
        let report = AbuseReport::pending(
            generate_id(),
            reporter_identity,
            target_node_id,
            abuse_type,
            description,
        );
        self.store
            .insert_abuse_report(&report)
            .map_err(MeshError::persistence)?;

        let severe = abuse_type.is_severe();
        self.metrics.record_abuse_report(severe);
        self.update_outcomes(target_node_id, |o| o.abuse_reports += 1);

        info!(
            report_id = %report.report_id,
            reporter = reporter_identity,
            node_id = target_node_id,
            abuse_type = %abuse_type,
            "Abuse report filed"
        );

        if let Some(penalty) = self.config.penalty_for(abuse_type) {
            let score = self
                .store
                .adjust_reputation(
                    target_node_id,
                    &format!("abuse:{abuse_type}"),
                    penalty,
                    description,
                )
                .map_err(MeshError::persistence)?;
            warn!(
                node_id = target_node_id,
                penalty,
                score,
                abuse_type = %abuse_type,
                "Severe abuse penalty applied"
            );
        }

        Ok(report)
    }

    /// Apply the small delta for one connection outcome. Returns the new score.
    pub fn record_connection_outcome(
        &self,
        node_id: &str,
        success: bool,
    ) -> Result<i32, MeshError> {
        let (delta, event_type) = if success {
            (self.config.connection_success_delta, "connection_success")
        } else {
            (self.config.connection_failure_delta, "connection_failure")
        };

        self.update_outcomes(node_id, |o| {
            if success {
                o.successful_connections += 1;
            } else {
                o.failed_connections += 1;
            }
        });

        let score = self
            .store
            .adjust_reputation(node_id, event_type, delta, event_type)
            .map_err(MeshError::persistence)?;
        debug!(node_id, delta, score, "Connection outcome recorded");
        Ok(score)
    }

    /// Outcome statistics for a node seen by this process
    pub fn get_stats(&self, node_id: &str) -> Option<NodeReputationStats> {
        let score = self
            .store
            .get_node(node_id)
            .ok()
            .flatten()
            .map(|n| n.reputation_score);
        self.outcomes.read().get(node_id).map(|o| NodeReputationStats {
            score,
            successful_connections: o.successful_connections,
            failed_connections: o.failed_connections,
            abuse_reports: o.abuse_reports,
            tracked_seconds: o.first_seen.elapsed().as_secs(),
            last_seen_seconds: o.last_seen.elapsed().as_secs(),
        })
    }
}

/// Reputation statistics for a node
#[derive(Debug, Clone)]
pub struct NodeReputationStats {
    pub score: Option<i32>,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub abuse_reports: u64,
    pub tracked_seconds: u64,
    pub last_seen_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_storage::MemoryStorage;
    use meshnet_types::{MeshNode, NodeType, ReportStatus, TrustLevel};

    fn tracker_with_node(score: i32) -> (ReputationTracker, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new());
        store
            .put_node(&MeshNode::new("node-x", "xavier", "10.0.0.3:7000", NodeType::Peer, score))
            .unwrap();
        let tracker = ReputationTracker::new(
            store.clone(),
            ReputationConfig::default(),
            Arc::new(MeshMetrics::new()),
        );
        (tracker, store)
    }

    #[test]
    fn test_severe_report_applies_exact_penalty() {
        let (tracker, store) = tracker_with_node(50);

        let report = tracker
            .report_abuse("reporter", "node-x", AbuseType::MaliciousNode, "relaying junk")
            .unwrap();
        assert_eq!(report.status, ReportStatus::Pending);

        let node = store.get_node("node-x").unwrap().unwrap();
        assert_eq!(node.reputation_score, 30);
        assert_eq!(store.list_abuse_reports("node-x").unwrap().len(), 1);
    }

    #[test]
    fn test_minor_report_leaves_score() {
        let (tracker, store) = tracker_with_node(50);

        tracker
            .report_abuse("reporter", "node-x", AbuseType::Spam, "noise")
            .unwrap();

        assert_eq!(store.get_node("node-x").unwrap().unwrap().reputation_score, 50);
        assert!(store.reputation_events("node-x").unwrap().is_empty());
        assert_eq!(tracker.get_stats("node-x").unwrap().abuse_reports, 1);
    }

    #[test]
    fn test_repeated_threats_ban_node() {
        let (tracker, store) = tracker_with_node(50);

        for _ in 0..2 {
            tracker
                .report_abuse("reporter", "node-x", AbuseType::SecurityThreat, "port scan")
                .unwrap();
        }

        let node = store.get_node("node-x").unwrap().unwrap();
        assert_eq!(node.reputation_score, 0);
        assert_eq!(node.trust_level, TrustLevel::Banned);
        assert!(!node.accepting_connections);
    }

    #[test]
    fn test_connection_outcomes() {
        let (tracker, _store) = tracker_with_node(50);

        assert_eq!(tracker.record_connection_outcome("node-x", true).unwrap(), 51);
        assert_eq!(tracker.record_connection_outcome("node-x", false).unwrap(), 49);

        let stats = tracker.get_stats("node-x").unwrap();
        assert_eq!(stats.successful_connections, 1);
        assert_eq!(stats.failed_connections, 1);
        assert_eq!(stats.score, Some(49));
    }

    #[test]
    fn test_outcome_table_evicts_least_recently_seen() {
        let store = Arc::new(MemoryStorage::new());
        for (id, owner) in [("node-a", "ann"), ("node-b", "ben"), ("node-c", "cat")] {
            store
                .put_node(&MeshNode::new(id, owner, "10.0.0.4:7000", NodeType::Peer, 50))
                .unwrap();
        }
        let tracker = ReputationTracker::new(
            store,
            ReputationConfig {
                max_tracked_nodes: 2,
                ..ReputationConfig::default()
            },
            Arc::new(MeshMetrics::new()),
        );

        tracker.record_connection_outcome("node-a", true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.record_connection_outcome("node-b", true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        // touching node-a again leaves node-b as the oldest
        tracker.record_connection_outcome("node-a", false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.record_connection_outcome("node-c", true).unwrap();

        assert_eq!(tracker.tracked_nodes(), 2);
        assert!(tracker.get_stats("node-b").is_none());
        assert_eq!(tracker.get_stats("node-a").unwrap().failed_connections, 1);
        assert!(tracker.get_stats("node-c").is_some());
    }

    #[test]
    fn test_report_fails_when_store_down() {
        let (tracker, store) = tracker_with_node(50);
        store.set_available(false);

        let err = tracker
            .report_abuse("reporter", "node-x", AbuseType::Other, "")
            .unwrap_err();
        assert!(matches!(err, MeshError::Persistence(_)));
    }
}
