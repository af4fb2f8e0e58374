//! MeshNet persistent store.
//!
//! `MeshStore` is the contract the networking layer talks to: a node table
//! indexed by owner identity and online flag, a path-finding function over
//! validated links, and a reputation-adjustment function that clamps scores
//! and re-evaluates trust. Two backends are provided: sled on disk and an
//! in-memory map for tests.

pub mod pathfinding;

use anyhow::Result;
use chrono::{DateTime, Utc};
use meshnet_types::{
    AbuseReport, MeshLink, MeshNode, MeshRoute, P2PConnection, PathRecord, ReportStatus,
    ReputationEvent, ReputationPolicy,
};
use parking_lot::{Mutex, RwLock};
use sled::{Db, Transactional, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use pathfinding::best_path;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Route not found: {0}")]
    RouteNotFound(String),
    #[error("Abuse report not found: {0}")]
    ReportNotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract for the mesh layer.
pub trait MeshStore: Send + Sync {
    fn put_node(&self, node: &MeshNode) -> Result<()>;
    fn get_node(&self, node_id: &str) -> Result<Option<MeshNode>>;
    /// Best online node owned by `identity`, if any.
    fn find_online_node_by_identity(&self, identity: &str) -> Result<Option<MeshNode>>;
    fn list_online_nodes(&self) -> Result<Vec<MeshNode>>;
    fn record_heartbeat(&self, node_id: &str, connections: usize, at: DateTime<Utc>)
        -> Result<()>;
    fn mark_node_offline(&self, node_id: &str, at: DateTime<Utc>) -> Result<()>;

    fn record_link(&self, link: &MeshLink) -> Result<()>;
    fn list_links(&self) -> Result<Vec<MeshLink>>;
    /// Best known path between two node ids.
    fn find_best_path(&self, source_node_id: &str, destination_node_id: &str)
        -> Result<Option<PathRecord>>;

    fn put_route(&self, route: &MeshRoute) -> Result<()>;
    fn get_route(&self, route_id: &str) -> Result<Option<MeshRoute>>;
    fn record_route_outcome(&self, route_id: &str, success: bool) -> Result<()>;

    fn archive_connection(&self, connection: &P2PConnection) -> Result<()>;
    fn get_archived_connection(&self, connection_id: &str) -> Result<Option<P2PConnection>>;

    fn insert_abuse_report(&self, report: &AbuseReport) -> Result<()>;
    fn list_abuse_reports(&self, node_id: &str) -> Result<Vec<AbuseReport>>;
    fn update_abuse_report_status(&self, report_id: &str, status: ReportStatus) -> Result<()>;

    /// Append a signed delta, clamp the score and re-evaluate trust.
    /// Returns the resulting score.
    fn adjust_reputation(
        &self,
        node_id: &str,
        event_type: &str,
        delta: i32,
        description: &str,
    ) -> Result<i32>;
    fn reputation_events(&self, node_id: &str) -> Result<Vec<ReputationEvent>>;

    fn policy(&self) -> &ReputationPolicy;
}

/// Apply `delta` to `node` under `policy`, returning the ledger entry.
fn apply_reputation_delta(
    node: &mut MeshNode,
    policy: &ReputationPolicy,
    event_type: &str,
    delta: i32,
    description: &str,
) -> ReputationEvent {
    let now = Utc::now();
    let score = policy.clamp(i64::from(node.reputation_score) + i64::from(delta));
    node.reputation_score = score;
    let level = policy.evaluate(score, node.trust_level);
    if level != node.trust_level {
        tracing::info!(
            node_id = %node.node_id,
            from = %node.trust_level,
            to = %level,
            score,
            "Trust level changed"
        );
        node.apply_trust_level(level);
    }
    node.updated_at = now;

    ReputationEvent {
        node_id: node.node_id.clone(),
        event_type: event_type.to_string(),
        delta,
        description: description.to_string(),
        score_after: score,
        recorded_at: now,
    }
}

/// Pick the preferred node among several owned by the same identity.
fn prefer_node(candidates: impl Iterator<Item = MeshNode>) -> Option<MeshNode> {
    candidates
        .filter(|n| n.is_online && n.trust_level != meshnet_types::TrustLevel::Banned)
        .max_by(|a, b| {
            a.accepting_connections
                .cmp(&b.accepting_connections)
                .then(a.reputation_score.cmp(&b.reputation_score))
                .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        })
}

fn event_key(event: &ReputationEvent) -> String {
    format!(
        "{}/{:020}/{}",
        event.node_id,
        event.recorded_at.timestamp_nanos_opt().unwrap_or_default(),
        meshnet_types::generate_id()
    )
}

fn link_key(link: &MeshLink) -> String {
    format!("{}->{}", link.from_node_id, link.to_node_id)
}

/// Sled-backed implementation
pub struct SledStorage {
    db: Db,
    nodes: Tree,
    links: Tree,
    routes: Tree,
    connections: Tree,
    abuse_reports: Tree,
    reputation_events: Tree,
    policy: ReputationPolicy,
    // serialises read-modify-write cycles on node and route records
    write_lock: Mutex<()>,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_policy(path, ReputationPolicy::default())
    }

    pub fn with_policy<P: AsRef<Path>>(path: P, policy: ReputationPolicy) -> Result<Self> {
        let db = sled::open(path)?;
        let nodes = db.open_tree("nodes")?;
        let links = db.open_tree("links")?;
        let routes = db.open_tree("routes")?;
        let connections = db.open_tree("connections")?;
        let abuse_reports = db.open_tree("abuse_reports")?;
        let reputation_events = db.open_tree("reputation_events")?;

        Ok(Self {
            db,
            nodes,
            links,
            routes,
            connections,
            abuse_reports,
            reputation_events,
            policy,
            write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn all_nodes(&self) -> Result<Vec<MeshNode>> {
        let mut out = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn update_node<F>(&self, node_id: &str, mutate: F) -> Result<MeshNode>
    where
        F: FnOnce(&mut MeshNode),
    {
        let _guard = self.write_lock.lock();
        let mut node: MeshNode = match self.nodes.get(node_id.as_bytes())? {
            Some(value) => serde_json::from_slice(&value)?,
            None => return Err(StorageError::NodeNotFound(node_id.to_string()).into()),
        };
        mutate(&mut node);
        self.nodes
            .insert(node_id.as_bytes(), serde_json::to_vec(&node)?)?;
        Ok(node)
    }
}

impl MeshStore for SledStorage {
    fn put_node(&self, node: &MeshNode) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.nodes
            .insert(node.node_id.as_bytes(), serde_json::to_vec(node)?)?;
        Ok(())
    }

    fn get_node(&self, node_id: &str) -> Result<Option<MeshNode>> {
        match self.nodes.get(node_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn find_online_node_by_identity(&self, identity: &str) -> Result<Option<MeshNode>> {
        let nodes = self.all_nodes()?;
        Ok(prefer_node(
            nodes.into_iter().filter(|n| n.owner_identity == identity),
        ))
    }

    fn list_online_nodes(&self) -> Result<Vec<MeshNode>> {
        Ok(self
            .all_nodes()?
            .into_iter()
            .filter(|n| n.is_online)
            .collect())
    }

    fn record_heartbeat(
        &self,
        node_id: &str,
        connections: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_node(node_id, |node| node.touch_heartbeat(connections, at))?;
        Ok(())
    }

    fn mark_node_offline(&self, node_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_node(node_id, |node| node.mark_offline(at))?;
        Ok(())
    }

    fn record_link(&self, link: &MeshLink) -> Result<()> {
        self.links
            .insert(link_key(link).as_bytes(), serde_json::to_vec(link)?)?;
        Ok(())
    }

    fn list_links(&self) -> Result<Vec<MeshLink>> {
        let mut out = Vec::new();
        for entry in self.links.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn find_best_path(
        &self,
        source_node_id: &str,
        destination_node_id: &str,
    ) -> Result<Option<PathRecord>> {
        let nodes: HashMap<_, _> = self
            .all_nodes()?
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        let links = self.list_links()?;
        Ok(best_path(&nodes, &links, source_node_id, destination_node_id))
    }

    fn put_route(&self, route: &MeshRoute) -> Result<()> {
        self.routes
            .insert(route.route_id.as_bytes(), serde_json::to_vec(route)?)?;
        Ok(())
    }

    fn get_route(&self, route_id: &str) -> Result<Option<MeshRoute>> {
        match self.routes.get(route_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn record_route_outcome(&self, route_id: &str, success: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut route: MeshRoute = match self.routes.get(route_id.as_bytes())? {
            Some(value) => serde_json::from_slice(&value)?,
            None => return Err(StorageError::RouteNotFound(route_id.to_string()).into()),
        };
        route.record_outcome(success);
        self.routes
            .insert(route_id.as_bytes(), serde_json::to_vec(&route)?)?;
        Ok(())
    }

    fn archive_connection(&self, connection: &P2PConnection) -> Result<()> {
        self.connections.insert(
            connection.connection_id.as_bytes(),
            serde_json::to_vec(connection)?,
        )?;
        Ok(())
    }

    fn get_archived_connection(&self, connection_id: &str) -> Result<Option<P2PConnection>> {
        match self.connections.get(connection_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn insert_abuse_report(&self, report: &AbuseReport) -> Result<()> {
        self.abuse_reports
            .insert(report.report_id.as_bytes(), serde_json::to_vec(report)?)?;
        Ok(())
    }

    fn list_abuse_reports(&self, node_id: &str) -> Result<Vec<AbuseReport>> {
        let mut out = Vec::new();
        for entry in self.abuse_reports.iter() {
            let (_, value) = entry?;
            let report: AbuseReport = serde_json::from_slice(&value)?;
            if report.reported_node_id == node_id {
                out.push(report);
            }
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    fn update_abuse_report_status(&self, report_id: &str, status: ReportStatus) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut report: AbuseReport = match self.abuse_reports.get(report_id.as_bytes())? {
            Some(value) => serde_json::from_slice(&value)?,
            None => return Err(StorageError::ReportNotFound(report_id.to_string()).into()),
        };
        report.status = status;
        self.abuse_reports
            .insert(report_id.as_bytes(), serde_json::to_vec(&report)?)?;
        Ok(())
    }

    fn adjust_reputation(
        &self,
        node_id: &str,
        event_type: &str,
        delta: i32,
        description: &str,
    ) -> Result<i32> {
        let _guard = self.write_lock.lock();
        let mut node: MeshNode = match self.nodes.get(node_id.as_bytes())? {
            Some(value) => serde_json::from_slice(&value)?,
            None => return Err(StorageError::NodeNotFound(node_id.to_string()).into()),
        };
        let event = apply_reputation_delta(&mut node, &self.policy, event_type, delta, description);

        // Node update and ledger append land together or not at all.
        let node_bytes = serde_json::to_vec(&node)?;
        let event_bytes = serde_json::to_vec(&event)?;
        let key = event_key(&event);
        (&self.nodes, &self.reputation_events)
            .transaction(|(nodes, events)| {
                nodes.insert(node_id.as_bytes(), node_bytes.as_slice())?;
                events.insert(key.as_bytes(), event_bytes.as_slice())?;
                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<()>| {
                anyhow::anyhow!("reputation transaction failed: {e:?}")
            })?;
        Ok(event.score_after)
    }

    fn reputation_events(&self, node_id: &str) -> Result<Vec<ReputationEvent>> {
        let mut out = Vec::new();
        for entry in self.reputation_events.scan_prefix(format!("{node_id}/").as_bytes()) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn policy(&self) -> &ReputationPolicy {
        &self.policy
    }
}

/// In-memory testing backend
pub struct MemoryStorage {
    nodes: Arc<RwLock<HashMap<String, MeshNode>>>,
    links: Arc<RwLock<HashMap<String, MeshLink>>>,
    routes: Arc<RwLock<HashMap<String, MeshRoute>>>,
    connections: Arc<RwLock<HashMap<String, P2PConnection>>>,
    abuse_reports: Arc<RwLock<Vec<AbuseReport>>>,
    reputation_events: Arc<RwLock<Vec<ReputationEvent>>>,
    policy: ReputationPolicy,
    available: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::with_policy(ReputationPolicy::default())
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ReputationPolicy) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
            routes: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            abuse_reports: Arc::new(RwLock::new(Vec::new())),
            reputation_events: Arc::new(RwLock::new(Vec::new())),
            policy,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store marked unavailable".to_string()).into())
        }
    }

    fn update_node<F>(&self, node_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut MeshNode),
    {
        self.ensure_available()?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| StorageError::NodeNotFound(node_id.to_string()))?;
        mutate(node);
        Ok(())
    }
}

impl MeshStore for MemoryStorage {
    fn put_node(&self, node: &MeshNode) -> Result<()> {
        self.ensure_available()?;
        self.nodes.write().insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    fn get_node(&self, node_id: &str) -> Result<Option<MeshNode>> {
        self.ensure_available()?;
        Ok(self.nodes.read().get(node_id).cloned())
    }

    fn find_online_node_by_identity(&self, identity: &str) -> Result<Option<MeshNode>> {
        self.ensure_available()?;
        let nodes = self.nodes.read();
        Ok(prefer_node(
            nodes
                .values()
                .filter(|n| n.owner_identity == identity)
                .cloned(),
        ))
    }

    fn list_online_nodes(&self) -> Result<Vec<MeshNode>> {
        self.ensure_available()?;
        Ok(self
            .nodes
            .read()
            .values()
            .filter(|n| n.is_online)
            .cloned()
            .collect())
    }

    fn record_heartbeat(
        &self,
        node_id: &str,
        connections: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_node(node_id, |node| node.touch_heartbeat(connections, at))
    }

    fn mark_node_offline(&self, node_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_node(node_id, |node| node.mark_offline(at))
    }

    fn record_link(&self, link: &MeshLink) -> Result<()> {
        self.ensure_available()?;
        self.links.write().insert(link_key(link), link.clone());
        Ok(())
    }

    fn list_links(&self) -> Result<Vec<MeshLink>> {
        self.ensure_available()?;
        Ok(self.links.read().values().cloned().collect())
    }

    fn find_best_path(
        &self,
        source_node_id: &str,
        destination_node_id: &str,
    ) -> Result<Option<PathRecord>> {
        self.ensure_available()?;
        let nodes = self.nodes.read();
        let links: Vec<MeshLink> = self.links.read().values().cloned().collect();
        Ok(best_path(&nodes, &links, source_node_id, destination_node_id))
    }

    fn put_route(&self, route: &MeshRoute) -> Result<()> {
        self.ensure_available()?;
        self.routes
            .write()
            .insert(route.route_id.clone(), route.clone());
        Ok(())
    }

    fn get_route(&self, route_id: &str) -> Result<Option<MeshRoute>> {
        self.ensure_available()?;
        Ok(self.routes.read().get(route_id).cloned())
    }

    fn record_route_outcome(&self, route_id: &str, success: bool) -> Result<()> {
        self.ensure_available()?;
        let mut routes = self.routes.write();
        let route = routes
            .get_mut(route_id)
            .ok_or_else(|| StorageError::RouteNotFound(route_id.to_string()))?;
        route.record_outcome(success);
        Ok(())
    }

    fn archive_connection(&self, connection: &P2PConnection) -> Result<()> {
        self.ensure_available()?;
        self.connections
            .write()
            .insert(connection.connection_id.clone(), connection.clone());
        Ok(())
    }

    fn get_archived_connection(&self, connection_id: &str) -> Result<Option<P2PConnection>> {
        self.ensure_available()?;
        Ok(self.connections.read().get(connection_id).cloned())
    }

    fn insert_abuse_report(&self, report: &AbuseReport) -> Result<()> {
        self.ensure_available()?;
        self.abuse_reports.write().push(report.clone());
        Ok(())
    }

    fn list_abuse_reports(&self, node_id: &str) -> Result<Vec<AbuseReport>> {
        self.ensure_available()?;
        Ok(self
            .abuse_reports
            .read()
            .iter()
            .filter(|r| r.reported_node_id == node_id)
            .cloned()
            .collect())
    }

    fn update_abuse_report_status(&self, report_id: &str, status: ReportStatus) -> Result<()> {
        self.ensure_available()?;
        let mut reports = self.abuse_reports.write();
        let report = reports
            .iter_mut()
            .find(|r| r.report_id == report_id)
            .ok_or_else(|| StorageError::ReportNotFound(report_id.to_string()))?;
        report.status = status;
        Ok(())
    }

    fn adjust_reputation(
        &self,
        node_id: &str,
        event_type: &str,
        delta: i32,
        description: &str,
    ) -> Result<i32> {
        self.ensure_available()?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| StorageError::NodeNotFound(node_id.to_string()))?;
        let event = apply_reputation_delta(node, &self.policy, event_type, delta, description);
        let score = event.score_after;
        // ledger append happens while the node lock is still held
        self.reputation_events.write().push(event);
        Ok(score)
    }

    fn reputation_events(&self, node_id: &str) -> Result<Vec<ReputationEvent>> {
        self.ensure_available()?;
        Ok(self
            .reputation_events
            .read()
            .iter()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect())
    }

    fn policy(&self) -> &ReputationPolicy {
        &self.policy
    }
}
