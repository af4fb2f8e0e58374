use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a node in the mesh.
pub type NodeId = String;

/// Role a node plays inside the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Peer,
    Relay,
    Edge,
    SuperNode,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Peer => "peer",
            NodeType::Relay => "relay",
            NodeType::Edge => "edge",
            NodeType::SuperNode => "super_node",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown node type: {0}")]
pub struct UnknownNodeType(pub String);

impl FromStr for NodeType {
    type Err = UnknownNodeType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "peer" => Ok(NodeType::Peer),
            "relay" => Ok(NodeType::Relay),
            "edge" => Ok(NodeType::Edge),
            "super_node" | "super-node" | "supernode" => Ok(NodeType::SuperNode),
            other => Err(UnknownNodeType(other.to_string())),
        }
    }
}

/// Categorical trust assigned to a node from its accumulated reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    New,
    Trusted,
    Verified,
    Suspicious,
    Banned,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::New => "new",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Verified => "verified",
            TrustLevel::Suspicious => "suspicious",
            TrustLevel::Banned => "banned",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit capability flags advertised by a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Node forwards traffic for other nodes.
    pub can_relay: bool,
    /// Node can carry AI-assisted media compression sessions.
    pub supports_ai_compression: bool,
    pub supports_transcoding: bool,
    pub supports_recording: bool,
}

/// Geographic placement of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self {
            region: "unknown".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// Observed link quality of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub latency_ms: u32,
    /// Packet loss ratio in the range 0.0 to 1.0
    pub packet_loss: f64,
    /// Uptime percentage in the range 0.0 to 100.0
    pub uptime_percent: f64,
}

impl Default for QualityStats {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            packet_loss: 0.0,
            uptime_percent: 100.0,
        }
    }
}

/// A participating process in the peer mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub node_id: NodeId,
    pub owner_identity: String,
    pub address: String,
    pub node_type: NodeType,
    pub max_connections: u32,
    pub current_connections: u32,
    pub bandwidth_capacity_mbps: u32,
    pub bandwidth_usage_mbps: u32,
    pub location: GeoLocation,
    pub quality: QualityStats,
    pub reputation_score: i32,
    pub trust_level: TrustLevel,
    pub is_online: bool,
    pub accepting_connections: bool,
    pub capabilities: NodeCapabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MeshNode {
    /// Build a fresh online node record with neutral quality and `New` trust.
    pub fn new(
        node_id: impl Into<NodeId>,
        owner_identity: impl Into<String>,
        address: impl Into<String>,
        node_type: NodeType,
        initial_score: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            owner_identity: owner_identity.into(),
            address: address.into(),
            node_type,
            max_connections: 50,
            current_connections: 0,
            bandwidth_capacity_mbps: 100,
            bandwidth_usage_mbps: 0,
            location: GeoLocation::default(),
            quality: QualityStats::default(),
            reputation_score: initial_score,
            trust_level: TrustLevel::New,
            is_online: true,
            accepting_connections: true,
            capabilities: NodeCapabilities::default(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the node can take another connection right now.
    pub fn has_capacity(&self) -> bool {
        self.accepting_connections && self.current_connections < self.max_connections
    }

    /// Set the live connection count, never exceeding `max_connections`.
    pub fn set_current_connections(&mut self, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.current_connections = count.min(self.max_connections);
    }

    /// Apply a trust level; a banned node stops accepting connections.
    pub fn apply_trust_level(&mut self, level: TrustLevel) {
        self.trust_level = level;
        if level == TrustLevel::Banned {
            self.accepting_connections = false;
        }
        self.updated_at = Utc::now();
    }

    /// Record a liveness heartbeat.
    pub fn touch_heartbeat(&mut self, connections: usize, at: DateTime<Utc>) {
        self.is_online = true;
        self.set_current_connections(connections);
        self.last_heartbeat = at;
        self.updated_at = at;
    }

    /// Mark the node offline. The record is kept so historical routes stay valid.
    pub fn mark_offline(&mut self, at: DateTime<Utc>) {
        self.is_online = false;
        self.current_connections = 0;
        self.updated_at = at;
    }
}
