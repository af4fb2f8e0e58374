//! Heartbeat publication and stale connection sweeping

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::metrics::MeshMetrics;
use crate::registry::NodeRegistry;

// tokio intervals reject a zero period
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Interval between stale connection sweeps
    pub sweep_interval: Duration,
    /// Age after which a non-active connection is considered abandoned
    pub stale_threshold: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

/// Handles for the two background loops
pub struct HealthTasks {
    pub heartbeat: JoinHandle<()>,
    pub sweep: JoinHandle<()>,
}

impl HealthTasks {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        if let Err(e) = self.sweep.await {
            warn!(error = %e, "Sweep task ended abnormally");
        }
    }
}

pub struct HealthMonitor {
    config: HealthCheckConfig,
    registry: Arc<NodeRegistry>,
    connections: ConnectionManager,
    metrics: Arc<MeshMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<NodeRegistry>,
        connections: ConnectionManager,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            connections,
            metrics,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Publish one heartbeat. Failures are logged and left for the next tick.
    pub fn heartbeat_once(&self) -> bool {
        match self.registry.heartbeat(Utc::now()) {
            Ok(count) => {
                self.metrics.record_heartbeat(true);
                debug!(connections = count, "Heartbeat sent");
                true
            }
            Err(e) => {
                self.metrics.record_heartbeat(false);
                warn!(node_id = %self.registry.node_id(), error = %e, "Heartbeat failed");
                false
            }
        }
    }

    /// Terminate non-active connections older than the stale threshold,
    /// measured at `now`. Returns the ids that were cleaned up.
    pub fn sweep_once_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let reaped = self.connections.reap_stale(now, threshold);
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Stale connection sweep finished");
        }
        reaped
    }

    pub fn sweep_once(&self) -> Vec<String> {
        self.sweep_once_at(Utc::now())
    }

    /// Run the heartbeat and sweep loops until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> HealthTasks {
        let heartbeat = {
            let monitor = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.heartbeat_interval.max(MIN_PERIOD));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.heartbeat_once();
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                debug!("Heartbeat loop shutting down");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let sweep = {
            let monitor = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.sweep_interval.max(MIN_PERIOD));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.sweep_once();
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                debug!("Sweep loop shutting down");
                                break;
                            }
                        }
                    }
                }
            })
        };

        HealthTasks { heartbeat, sweep }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionTable};
    use crate::memory_transport::MemoryTransport;
    use crate::registry::NodeDefaults;
    use crate::reputation::{ReputationConfig, ReputationTracker};
    use crate::routing::{RouteResolver, StoreRouteProvider};
    use crate::transport::TransportState;
    use meshnet_storage::{MemoryStorage, MeshStore};
    use meshnet_types::{MeshNode, NodeType};

    struct Fixture {
        monitor: Arc<HealthMonitor>,
        manager: ConnectionManager,
        transport: Arc<MemoryTransport>,
        store: Arc<MemoryStorage>,
        registry: Arc<NodeRegistry>,
    }

    fn fixture() -> Fixture {
        fixture_with(HealthCheckConfig::default())
    }

    fn fixture_with(config: HealthCheckConfig) -> Fixture {
        let store = Arc::new(MemoryStorage::new());
        store
            .put_node(&MeshNode::new("remote", "bob", "10.0.0.2:7000", NodeType::Peer, 50))
            .unwrap();
        let table = ConnectionTable::new();
        let registry = Arc::new(
            NodeRegistry::register_node(
                store.clone(),
                table.clone(),
                "alice",
                NodeType::Peer,
                &NodeDefaults::default(),
            )
            .unwrap(),
        );
        let metrics = Arc::new(MeshMetrics::new());
        let fallback = Arc::new(StoreRouteProvider::new(store.clone(), Duration::from_secs(60)));
        let resolver = Arc::new(RouteResolver::new(None, fallback, store.clone(), metrics.clone()));
        let reputation = Arc::new(ReputationTracker::new(
            store.clone(),
            ReputationConfig::default(),
            metrics.clone(),
        ));
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            registry.local().clone(),
            table,
            resolver,
            transport.clone(),
            store.clone(),
            reputation,
            metrics.clone(),
        );
        let monitor = Arc::new(HealthMonitor::new(
            config,
            registry.clone(),
            manager.clone(),
            metrics,
        ));
        Fixture {
            monitor,
            manager,
            transport,
            store,
            registry,
        }
    }

    #[tokio::test]
    async fn test_sweep_reaps_only_stale_non_active() {
        let f = fixture();
        let active = f.manager.establish_connection("bob", false).await.unwrap();
        f.transport
            .last_session()
            .unwrap()
            .simulate_state(TransportState::Connected);
        let pending = f.manager.establish_connection("bob", false).await.unwrap();

        // nothing is old enough yet
        assert!(f.monitor.sweep_once().is_empty());

        let later = Utc::now() + chrono::Duration::minutes(6);
        let reaped = f.monitor.sweep_once_at(later);
        assert_eq!(reaped, vec![pending.connection_id]);
        assert!(f.manager.get_connection(&active.connection_id).is_some());
        assert_eq!(f.manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_table_size() {
        let f = fixture();
        f.manager.establish_connection("bob", false).await.unwrap();

        assert!(f.monitor.heartbeat_once());
        let node = f.store.get_node(f.registry.node_id()).unwrap().unwrap();
        assert_eq!(node.current_connections, 1);

        f.store.set_available(false);
        assert!(!f.monitor.heartbeat_once());
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let tasks = f.monitor.clone().spawn(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.join())
            .await
            .expect("health loops did not stop");
    }

    #[tokio::test]
    async fn test_zero_intervals_do_not_kill_loops() {
        let f = fixture_with(HealthCheckConfig {
            heartbeat_interval: Duration::ZERO,
            sweep_interval: Duration::ZERO,
            stale_threshold: Duration::ZERO,
        });
        let (tx, rx) = watch::channel(false);
        let tasks = f.monitor.clone().spawn(rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!tasks.heartbeat.is_finished());
        assert!(!tasks.sweep.is_finished());

        tx.send(true).unwrap();
        tasks.heartbeat.await.unwrap();
        tasks.sweep.await.unwrap();
    }
}
