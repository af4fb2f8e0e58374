//! Mesh service assembly.
//!
//! Wires the registry, resolver, connection manager, reputation tracker and
//! health monitor over one store and one transport, and owns the background
//! loops.

use meshnet_storage::MeshStore;
use meshnet_types::{AbuseReport, AbuseType, MeshNode, MeshRoute, NodeType, P2PConnection};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionTable};
use crate::errors::MeshError;
use crate::health::{HealthCheckConfig, HealthMonitor, HealthTasks};
use crate::metrics::{MeshMetrics, MeshMetricsSnapshot};
use crate::registry::{NodeDefaults, NodeRegistry};
use crate::reputation::{ReputationConfig, ReputationTracker};
use crate::routing::{RouteResolver, RoutingConfig};
use crate::signaling::SignalingRelay;
use crate::transport::PeerTransport;

/// Everything needed to bring a mesh node up
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub identity: String,
    pub node_type: NodeType,
    pub node: NodeDefaults,
    pub routing: RoutingConfig,
    pub connection: ConnectionConfig,
    pub health: HealthCheckConfig,
    pub reputation: ReputationConfig,
}

impl MeshConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            node_type: NodeType::Peer,
            node: NodeDefaults::default(),
            routing: RoutingConfig::default(),
            connection: ConnectionConfig::default(),
            health: HealthCheckConfig::default(),
            reputation: ReputationConfig::default(),
        }
    }
}

/// A running mesh node
pub struct MeshService {
    registry: Arc<NodeRegistry>,
    resolver: Arc<RouteResolver>,
    connections: ConnectionManager,
    reputation: Arc<ReputationTracker>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MeshMetrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<HealthTasks>>,
}

impl MeshService {
    /// Register the local node and start the health loops. Must be called
    /// from within a tokio runtime.
    pub fn start(
        config: MeshConfig,
        store: Arc<dyn MeshStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, MeshError> {
        let metrics = Arc::new(MeshMetrics::new());

        // resolve config problems before anything is persisted
        let resolver = Arc::new(
            RouteResolver::from_config(&config.routing, store.clone(), metrics.clone())
                .map_err(|e| MeshError::Registration(format!("routing configuration: {e}")))?,
        );
        if !resolver.has_primary() {
            warn!("No AI routing service configured, using local path finding only");
        }

        let table = ConnectionTable::new();
        let registry = Arc::new(NodeRegistry::register_node(
            store.clone(),
            table.clone(),
            &config.identity,
            config.node_type,
            &config.node,
        )?);

        let reputation = Arc::new(ReputationTracker::new(
            store.clone(),
            config.reputation.clone(),
            metrics.clone(),
        ));
        let connections = ConnectionManager::new(
            config.connection.clone(),
            registry.local().clone(),
            table,
            resolver.clone(),
            transport,
            store,
            reputation.clone(),
            metrics.clone(),
        );
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            connections.clone(),
            metrics.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = health.clone().spawn(shutdown_rx);

        info!(
            node_id = %registry.node_id(),
            identity = %config.identity,
            max_connections = config.connection.max_connections,
            "Mesh service started"
        );

        Ok(Self {
            registry,
            resolver,
            connections,
            reputation,
            health,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn reputation(&self) -> &ReputationTracker {
        &self.reputation
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn metrics(&self) -> MeshMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn attach_signaling(&self, relay: Arc<dyn SignalingRelay>) {
        self.connections.attach_signaling(relay);
    }

    pub fn node_info(&self) -> Result<MeshNode, MeshError> {
        self.registry.get_node_info()
    }

    pub async fn connect(
        &self,
        target_identity: &str,
        require_advanced_feature: bool,
    ) -> Result<P2PConnection, MeshError> {
        self.connections
            .establish_connection(target_identity, require_advanced_feature)
            .await
    }

    /// Resolve a route from this node to `destination_identity` without
    /// opening a connection.
    pub async fn request_route(
        &self,
        destination_identity: &str,
        require_advanced_feature: bool,
    ) -> Result<MeshRoute, MeshError> {
        let source = self.registry.identity();
        self.resolver
            .request_route_from(
                Some(self.registry.node_id()),
                source,
                destination_identity,
                require_advanced_feature,
            )
            .await
            .map_err(|e| MeshError::from_routing(e, source, destination_identity))
    }

    pub fn report_abuse(
        &self,
        target_node_id: &str,
        abuse_type: AbuseType,
        description: &str,
    ) -> Result<AbuseReport, MeshError> {
        self.reputation
            .report_abuse(self.registry.identity(), target_node_id, abuse_type, description)
    }

    /// Stop the loops, tear down live connections and mark the node
    /// offline. Marking offline is attempted even if teardown hit errors.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        let _ = self.shutdown_tx.send(true);
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.join().await;
        }

        let terminated = self.connections.terminate_all();
        let result = self.registry.mark_offline();
        info!(
            node_id = %self.registry.node_id(),
            terminated,
            "Mesh service stopped"
        );
        result
    }
}
