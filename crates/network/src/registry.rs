//! Local node registration.
//!
//! The registry owns the local node's identity and its persisted record.
//! The live connection count is never trusted from the store; snapshots
//! overlay the size of the connection table.

use chrono::{DateTime, Utc};
use meshnet_storage::MeshStore;
use meshnet_types::{
    generate_id, GeoLocation, MeshNode, NodeCapabilities, NodeId, NodeType, QualityStats,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::ConnectionTable;
use crate::errors::MeshError;

/// Fields used to populate a freshly registered node
#[derive(Debug, Clone)]
pub struct NodeDefaults {
    pub address: String,
    pub max_connections: u32,
    pub bandwidth_capacity_mbps: u32,
    pub location: GeoLocation,
    pub quality: QualityStats,
    pub capabilities: NodeCapabilities,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:0".to_string(),
            max_connections: 50,
            bandwidth_capacity_mbps: 100,
            location: GeoLocation::default(),
            quality: QualityStats::default(),
            capabilities: NodeCapabilities::default(),
        }
    }
}

/// Handle naming the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub node_id: NodeId,
    pub identity: String,
}

pub struct NodeRegistry {
    local: LocalNode,
    store: Arc<dyn MeshStore>,
    connections: ConnectionTable,
}

impl NodeRegistry {
    /// Create and persist the local node record. Failure here is fatal to
    /// startup.
    pub fn register_node(
        store: Arc<dyn MeshStore>,
        connections: ConnectionTable,
        identity: &str,
        node_type: NodeType,
        defaults: &NodeDefaults,
    ) -> Result<Self, MeshError> {
        let node_id = generate_id();
        let mut node = MeshNode::new(
            node_id.clone(),
            identity,
            defaults.address.clone(),
            node_type,
            store.policy().initial_score,
        );
        node.max_connections = defaults.max_connections;
        node.bandwidth_capacity_mbps = defaults.bandwidth_capacity_mbps;
        node.location = defaults.location.clone();
        node.quality = defaults.quality.clone();
        node.capabilities = defaults.capabilities.clone();

        store
            .put_node(&node)
            .map_err(|e| MeshError::Registration(format!("{e:#}")))?;

        info!(
            node_id = %node_id,
            identity,
            node_type = %node_type,
            address = %node.address,
            "Mesh node registered"
        );

        Ok(Self {
            local: LocalNode {
                node_id,
                identity: identity.to_string(),
            },
            store,
            connections,
        })
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn node_id(&self) -> &str {
        &self.local.node_id
    }

    pub fn identity(&self) -> &str {
        &self.local.identity
    }

    /// Stored record with the live connection count overlaid.
    pub fn get_node_info(&self) -> Result<MeshNode, MeshError> {
        let mut node = self
            .store
            .get_node(&self.local.node_id)
            .map_err(MeshError::persistence)?
            .ok_or_else(|| {
                MeshError::Persistence(format!("local node {} missing", self.local.node_id))
            })?;
        node.set_current_connections(self.connections.len());
        Ok(node)
    }

    /// Publish liveness and the current table size.
    pub fn heartbeat(&self, at: DateTime<Utc>) -> Result<usize, MeshError> {
        let count = self.connections.len();
        self.store
            .record_heartbeat(&self.local.node_id, count, at)
            .map_err(MeshError::persistence)?;
        debug!(node_id = %self.local.node_id, connections = count, "Heartbeat published");
        Ok(count)
    }

    /// Mark the local node offline. The record itself is kept.
    pub fn mark_offline(&self) -> Result<(), MeshError> {
        self.store
            .mark_node_offline(&self.local.node_id, Utc::now())
            .map_err(MeshError::persistence)?;
        info!(node_id = %self.local.node_id, "Mesh node marked offline");
        Ok(())
    }
}
