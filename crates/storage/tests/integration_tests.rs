//! Integration tests for storage backends (Sled and in-memory).
//! Tests the node table, link graph, routes, archived connections,
//! abuse reports and the reputation ledger.

use chrono::{Duration, Utc};
use meshnet_storage::{MemoryStorage, MeshStore, SledStorage};
use meshnet_types::{
    AbuseReport, AbuseType, ConnectionStatus, MeshLink, MeshNode, MeshRoute, NodeType,
    P2PConnection, ReportStatus, RouteOrigin, TrustLevel,
};
use tempfile::TempDir;

/// Helper to create a test node
fn create_test_node(id: &str, identity: &str, node_type: NodeType) -> MeshNode {
    MeshNode::new(id, identity, format!("10.0.0.1:{}", 4000 + id.len()), node_type, 50)
}

/// Helper to create a test route over `path`
fn create_test_route(id: &str, path: &[&str]) -> MeshRoute {
    MeshRoute::from_path(
        id,
        path.iter().map(|s| s.to_string()).collect(),
        0.8,
        40,
        50,
        RouteOrigin::LocalFallback,
        Duration::minutes(5),
    )
    .unwrap()
}

fn test_node_storage<S: MeshStore>(storage: &S) {
    let node = create_test_node("node-a", "alice", NodeType::Peer);
    storage.put_node(&node).unwrap();

    let loaded = storage.get_node("node-a").unwrap().unwrap();
    assert_eq!(loaded.owner_identity, "alice");
    assert_eq!(loaded.reputation_score, 50);
    assert!(storage.get_node("missing").unwrap().is_none());

    let found = storage.find_online_node_by_identity("alice").unwrap().unwrap();
    assert_eq!(found.node_id, "node-a");

    storage.record_heartbeat("node-a", 7, Utc::now()).unwrap();
    assert_eq!(
        storage.get_node("node-a").unwrap().unwrap().current_connections,
        7
    );

    assert_eq!(storage.list_online_nodes().unwrap().len(), 1);
    storage.mark_node_offline("node-a", Utc::now()).unwrap();
    assert!(storage.list_online_nodes().unwrap().is_empty());
    assert!(storage.find_online_node_by_identity("alice").unwrap().is_none());

    assert!(storage.record_heartbeat("missing", 1, Utc::now()).is_err());
}

fn test_banned_nodes_are_skipped<S: MeshStore>(storage: &S) {
    let mut banned = create_test_node("node-b", "bob", NodeType::Peer);
    banned.apply_trust_level(TrustLevel::Banned);
    banned.accepting_connections = true;
    storage.put_node(&banned).unwrap();

    assert!(storage.find_online_node_by_identity("bob").unwrap().is_none());
}

fn test_path_finding<S: MeshStore>(storage: &S) {
    for node in [
        create_test_node("src", "alice", NodeType::Peer),
        create_test_node("relay", "ops", NodeType::Relay),
        create_test_node("dst", "bob", NodeType::Peer),
    ] {
        storage.put_node(&node).unwrap();
    }
    storage
        .record_link(&MeshLink::validated("src", "relay", 10, 80))
        .unwrap();
    storage
        .record_link(&MeshLink::validated("relay", "dst", 15, 60))
        .unwrap();
    assert_eq!(storage.list_links().unwrap().len(), 2);

    let record = storage.find_best_path("src", "dst").unwrap().unwrap();
    assert_eq!(record.path, vec!["src", "relay", "dst"]);
    assert_eq!(record.total_latency_ms, 25);
    assert_eq!(record.min_bandwidth_mbps, 60);

    storage.mark_node_offline("dst", Utc::now()).unwrap();
    assert!(storage.find_best_path("src", "dst").unwrap().is_none());
}

fn test_route_storage<S: MeshStore>(storage: &S) {
    let route = create_test_route("route-1", &["a", "b"]);
    storage.put_route(&route).unwrap();

    storage.record_route_outcome("route-1", true).unwrap();
    storage.record_route_outcome("route-1", false).unwrap();

    let loaded = storage.get_route("route-1").unwrap().unwrap();
    assert_eq!(loaded.usage_count, 2);
    assert!((loaded.success_rate - 0.5).abs() < f64::EPSILON);
    assert!(storage.record_route_outcome("missing", true).is_err());
}

fn test_connection_archive<S: MeshStore>(storage: &S) {
    let mut connection = P2PConnection::establishing("conn-1", "a", "b", "route-1");
    connection
        .transition(ConnectionStatus::Terminated, Utc::now())
        .unwrap();
    storage.archive_connection(&connection).unwrap();

    let loaded = storage.get_archived_connection("conn-1").unwrap().unwrap();
    assert_eq!(loaded.status, ConnectionStatus::Terminated);
    assert!(loaded.terminated_at.is_some());
}

fn test_abuse_reports<S: MeshStore>(storage: &S) {
    let report = AbuseReport::pending("r-1", "carol", "node-x", AbuseType::Spam, "flooding");
    storage.insert_abuse_report(&report).unwrap();
    storage
        .insert_abuse_report(&AbuseReport::pending(
            "r-2",
            "carol",
            "node-y",
            AbuseType::Other,
            "unrelated",
        ))
        .unwrap();

    let reports = storage.list_abuse_reports("node-x").unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Pending);

    storage
        .update_abuse_report_status("r-1", ReportStatus::Reviewed)
        .unwrap();
    assert_eq!(
        storage.list_abuse_reports("node-x").unwrap()[0].status,
        ReportStatus::Reviewed
    );
    assert!(storage
        .update_abuse_report_status("missing", ReportStatus::Reviewed)
        .is_err());
}

fn test_reputation_ledger<S: MeshStore>(storage: &S) {
    storage
        .put_node(&create_test_node("node-r", "rita", NodeType::Peer))
        .unwrap();

    assert_eq!(
        storage
            .adjust_reputation("node-r", "connection_success", 15, "ok")
            .unwrap(),
        65
    );
    assert_eq!(
        storage.get_node("node-r").unwrap().unwrap().trust_level,
        TrustLevel::Trusted
    );

    assert_eq!(
        storage
            .adjust_reputation("node-r", "bonus", 500, "huge")
            .unwrap(),
        100
    );
    assert_eq!(
        storage.get_node("node-r").unwrap().unwrap().trust_level,
        TrustLevel::Verified
    );

    let events = storage.reputation_events("node-r").unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].score_after, 100);
    assert!(storage.reputation_events("other").unwrap().is_empty());
    assert!(storage.adjust_reputation("missing", "x", 1, "").is_err());
}

// ============================================================================
// Memory storage tests
// ============================================================================

#[test]
fn memory_storage_nodes() {
    let storage = MemoryStorage::new();
    test_node_storage(&storage);
}

#[test]
fn memory_storage_banned_nodes() {
    let storage = MemoryStorage::new();
    test_banned_nodes_are_skipped(&storage);
}

#[test]
fn memory_storage_paths() {
    let storage = MemoryStorage::new();
    test_path_finding(&storage);
}

#[test]
fn memory_storage_routes() {
    let storage = MemoryStorage::new();
    test_route_storage(&storage);
}

#[test]
fn memory_storage_connections() {
    let storage = MemoryStorage::new();
    test_connection_archive(&storage);
}

#[test]
fn memory_storage_abuse_reports() {
    let storage = MemoryStorage::new();
    test_abuse_reports(&storage);
}

#[test]
fn memory_storage_reputation() {
    let storage = MemoryStorage::new();
    test_reputation_ledger(&storage);
}

// ============================================================================
// Sled storage tests
// ============================================================================

#[test]
fn sled_storage_nodes() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_node_storage(&storage);
}

#[test]
fn sled_storage_banned_nodes() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_banned_nodes_are_skipped(&storage);
}

#[test]
fn sled_storage_paths() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_path_finding(&storage);
}

#[test]
fn sled_storage_routes() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_route_storage(&storage);
}

#[test]
fn sled_storage_connections() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_connection_archive(&storage);
}

#[test]
fn sled_storage_abuse_reports() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_abuse_reports(&storage);
}

#[test]
fn sled_storage_reputation() {
    let temp_dir = TempDir::new().unwrap();
    let storage = SledStorage::new(temp_dir.path()).unwrap();
    test_reputation_ledger(&storage);
}

#[test]
fn sled_storage_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = SledStorage::new(temp_dir.path()).unwrap();
        storage
            .put_node(&create_test_node("node-p", "pat", NodeType::Edge))
            .unwrap();
        storage.adjust_reputation("node-p", "seed", 5, "").unwrap();
        storage.flush().unwrap();
    }

    let storage = SledStorage::new(temp_dir.path()).unwrap();
    let node = storage.get_node("node-p").unwrap().unwrap();
    assert_eq!(node.node_type, NodeType::Edge);
    assert_eq!(node.reputation_score, 55);
    assert_eq!(storage.reputation_events("node-p").unwrap().len(), 1);
}
