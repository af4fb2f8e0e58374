use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::node::NodeId;

/// Media hint passed to the routing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    #[default]
    Video,
    Screen,
    Data,
}

/// Which resolver tier produced a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
    AiService,
    LocalFallback,
}

/// Reasons a path cannot form a valid route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must contain at least a source and a destination")]
    TooShort,
    #[error("node {0} appears more than once in the path")]
    RepeatedNode(NodeId),
    #[error("path does not start at {expected}")]
    WrongSource { expected: NodeId },
    #[error("path does not end at {expected}")]
    WrongDestination { expected: NodeId },
}

/// Check that a path is loop free and has at least two nodes.
pub fn validate_path(path: &[NodeId]) -> Result<(), PathError> {
    if path.len() < 2 {
        return Err(PathError::TooShort);
    }
    let mut seen = HashSet::with_capacity(path.len());
    for node in path {
        if !seen.insert(node.as_str()) {
            return Err(PathError::RepeatedNode(node.clone()));
        }
    }
    Ok(())
}

/// Best path returned by the store's path-finding function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    pub path: Vec<NodeId>,
    pub total_latency_ms: u32,
    pub min_bandwidth_mbps: u32,
}

impl PathRecord {
    pub fn hop_count(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

/// Validated adjacency between two nodes, walked by the path finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshLink {
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub latency_ms: u32,
    pub bandwidth_mbps: u32,
    pub validated: bool,
    pub observed_at: DateTime<Utc>,
}

impl MeshLink {
    pub fn validated(
        from_node_id: impl Into<NodeId>,
        to_node_id: impl Into<NodeId>,
        latency_ms: u32,
        bandwidth_mbps: u32,
    ) -> Self {
        Self {
            from_node_id: from_node_id.into(),
            to_node_id: to_node_id.into(),
            latency_ms,
            bandwidth_mbps,
            validated: true,
            observed_at: Utc::now(),
        }
    }
}

/// An ordered path between two mesh nodes with predicted quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshRoute {
    pub route_id: String,
    pub source_node_id: NodeId,
    pub destination_node_id: NodeId,
    /// Full path including both endpoints.
    pub path: Vec<NodeId>,
    pub path_length: u32,
    pub predicted_score: f64,
    pub predicted_latency_ms: u32,
    pub predicted_bandwidth_mbps: u32,
    pub actual_latency_ms: Option<u32>,
    pub actual_bandwidth_mbps: Option<u32>,
    pub is_active: bool,
    pub is_optimal: bool,
    pub usage_count: u64,
    pub success_rate: f64,
    pub origin: RouteOrigin,
    /// Set when an advisory feature requirement could not be met.
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MeshRoute {
    /// Build a route over `path`; source and destination are its endpoints.
    pub fn from_path(
        route_id: impl Into<String>,
        path: Vec<NodeId>,
        predicted_score: f64,
        predicted_latency_ms: u32,
        predicted_bandwidth_mbps: u32,
        origin: RouteOrigin,
        ttl: Duration,
    ) -> Result<Self, PathError> {
        validate_path(&path)?;
        let created_at = Utc::now();
        // expires_at must stay strictly after created_at
        let ttl = if ttl <= Duration::zero() {
            Duration::seconds(1)
        } else {
            ttl
        };
        let source_node_id = path[0].clone();
        let destination_node_id = path[path.len() - 1].clone();
        let path_length = u32::try_from(path.len() - 1).unwrap_or(u32::MAX);

        Ok(Self {
            route_id: route_id.into(),
            source_node_id,
            destination_node_id,
            path,
            path_length,
            predicted_score,
            predicted_latency_ms,
            predicted_bandwidth_mbps,
            actual_latency_ms: None,
            actual_bandwidth_mbps: None,
            is_active: true,
            is_optimal: origin == RouteOrigin::AiService,
            usage_count: 0,
            success_rate: 0.0,
            origin,
            degraded: false,
            created_at,
            expires_at: created_at + ttl,
        })
    }

    pub fn hop_count(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// First node after the source, i.e. where signaling is addressed.
    pub fn next_hop(&self) -> Option<&NodeId> {
        self.path.get(1)
    }

    /// Reject routes that do not leave from `expected`.
    pub fn ensure_source(&self, expected: &str) -> Result<(), PathError> {
        if self.source_node_id == expected {
            Ok(())
        } else {
            Err(PathError::WrongSource {
                expected: expected.to_string(),
            })
        }
    }

    /// Reject routes that do not arrive at `expected`.
    pub fn ensure_destination(&self, expected: &str) -> Result<(), PathError> {
        if self.destination_node_id == expected {
            Ok(())
        } else {
            Err(PathError::WrongDestination {
                expected: expected.to_string(),
            })
        }
    }

    /// Fold one connection outcome into usage statistics.
    pub fn record_outcome(&mut self, success: bool) {
        let previous = self.usage_count as f64;
        self.usage_count += 1;
        let hit = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * previous + hit) / self.usage_count as f64;
    }

    /// Ordering used to pick between equally scored candidates:
    /// higher score, then fewer hops, then lower predicted latency.
    pub fn preference_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .predicted_score
            .total_cmp(&self.predicted_score)
            .then(self.hop_count().cmp(&other.hop_count()))
            .then(self.predicted_latency_ms.cmp(&other.predicted_latency_ms))
    }
}
