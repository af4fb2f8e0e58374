//! Best-path search over the validated link graph.
//!
//! Paths are ranked by hop count first and accumulated latency second. When
//! no validated chain of links joins the endpoints, a direct two-node path is
//! assumed with latency estimated from both nodes' quality stats.

use meshnet_types::{MeshLink, MeshNode, NodeId, NodeType, PathRecord};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Cost {
    hops: u32,
    latency_ms: u64,
}

fn can_forward(node: &MeshNode) -> bool {
    node.is_online
        && node.accepting_connections
        && (node.capabilities.can_relay || node.node_type != NodeType::Peer)
}

fn spare_bandwidth(node: &MeshNode) -> u32 {
    node.bandwidth_capacity_mbps
        .saturating_sub(node.bandwidth_usage_mbps)
}

/// Find the best path from `source` to `destination`.
///
/// `nodes` must contain every node the caller wants considered; offline
/// nodes are skipped. Links are usable in both directions.
pub fn best_path(
    nodes: &HashMap<NodeId, MeshNode>,
    links: &[MeshLink],
    source: &str,
    destination: &str,
) -> Option<PathRecord> {
    if source == destination {
        return None;
    }
    let src = nodes.get(source).filter(|n| n.is_online)?;
    let dst = nodes.get(destination).filter(|n| n.is_online)?;

    let mut adjacency: HashMap<&str, Vec<(&str, u32, u32)>> = HashMap::new();
    for link in links.iter().filter(|l| l.validated) {
        let (a, b) = (link.from_node_id.as_str(), link.to_node_id.as_str());
        adjacency
            .entry(a)
            .or_default()
            .push((b, link.latency_ms, link.bandwidth_mbps));
        adjacency
            .entry(b)
            .or_default()
            .push((a, link.latency_ms, link.bandwidth_mbps));
    }

    let mut best: HashMap<&str, Cost> = HashMap::new();
    let mut previous: HashMap<&str, (&str, u32)> = HashMap::new();
    let mut heap = BinaryHeap::new();
    best.insert(source, Cost { hops: 0, latency_ms: 0 });
    heap.push(Reverse((Cost { hops: 0, latency_ms: 0 }, source)));

    while let Some(Reverse((cost, current))) = heap.pop() {
        if current == destination {
            break;
        }
        if best.get(current).is_some_and(|known| *known < cost) {
            continue;
        }
        // Only the source may originate traffic without relay capability.
        if current != source && !nodes.get(current).is_some_and(can_forward) {
            continue;
        }
        for &(next, latency, bandwidth) in adjacency.get(current).into_iter().flatten() {
            let Some(node) = nodes.get(next) else {
                continue;
            };
            if !node.is_online {
                continue;
            }
            let candidate = Cost {
                hops: cost.hops + 1,
                latency_ms: cost.latency_ms + u64::from(latency),
            };
            if best.get(next).map_or(true, |known| candidate < *known) {
                best.insert(next, candidate);
                previous.insert(next, (current, bandwidth));
                heap.push(Reverse((candidate, next)));
            }
        }
    }

    match best.get(destination) {
        Some(cost) => {
            let mut path = vec![destination.to_string()];
            let mut min_bandwidth = u32::MAX;
            let mut cursor = destination;
            while let Some(&(prev, bandwidth)) = previous.get(cursor) {
                min_bandwidth = min_bandwidth.min(bandwidth);
                path.push(prev.to_string());
                cursor = prev;
            }
            path.reverse();
            Some(PathRecord {
                path,
                total_latency_ms: u32::try_from(cost.latency_ms).unwrap_or(u32::MAX),
                min_bandwidth_mbps: min_bandwidth,
            })
        }
        None => Some(PathRecord {
            path: vec![source.to_string(), destination.to_string()],
            total_latency_ms: src.quality.latency_ms.saturating_add(dst.quality.latency_ms),
            min_bandwidth_mbps: spare_bandwidth(src).min(spare_bandwidth(dst)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: NodeType) -> MeshNode {
        let mut node = MeshNode::new(id, format!("{id}-owner"), "127.0.0.1:0", node_type, 50);
        node.quality.latency_ms = 20;
        node
    }

    fn graph(entries: Vec<MeshNode>) -> HashMap<NodeId, MeshNode> {
        entries.into_iter().map(|n| (n.node_id.clone(), n)).collect()
    }

    #[test]
    fn direct_path_when_no_links_known() {
        let nodes = graph(vec![node("a", NodeType::Peer), node("b", NodeType::Peer)]);
        let record = best_path(&nodes, &[], "a", "b").unwrap();
        assert_eq!(record.path, vec!["a", "b"]);
        assert_eq!(record.total_latency_ms, 40);
        assert_eq!(record.min_bandwidth_mbps, 100);
    }

    #[test]
    fn prefers_fewer_hops_over_lower_latency() {
        let nodes = graph(vec![
            node("a", NodeType::Peer),
            node("r1", NodeType::Relay),
            node("r2", NodeType::Relay),
            node("b", NodeType::Peer),
        ]);
        let links = vec![
            MeshLink::validated("a", "r1", 5, 100),
            MeshLink::validated("r1", "r2", 5, 100),
            MeshLink::validated("r2", "b", 5, 100),
            MeshLink::validated("a", "b", 200, 10),
        ];
        let record = best_path(&nodes, &links, "a", "b").unwrap();
        assert_eq!(record.path, vec!["a", "b"]);
        assert_eq!(record.total_latency_ms, 200);
    }

    #[test]
    fn equal_hops_broken_by_latency() {
        let nodes = graph(vec![
            node("a", NodeType::Peer),
            node("slow", NodeType::Relay),
            node("fast", NodeType::Relay),
            node("b", NodeType::Peer),
        ]);
        let links = vec![
            MeshLink::validated("a", "slow", 50, 100),
            MeshLink::validated("slow", "b", 50, 100),
            MeshLink::validated("a", "fast", 10, 40),
            MeshLink::validated("fast", "b", 10, 80),
        ];
        let record = best_path(&nodes, &links, "a", "b").unwrap();
        assert_eq!(record.path, vec!["a", "fast", "b"]);
        assert_eq!(record.total_latency_ms, 20);
        assert_eq!(record.min_bandwidth_mbps, 40);
    }

    #[test]
    fn plain_peers_do_not_forward() {
        let nodes = graph(vec![
            node("a", NodeType::Peer),
            node("p", NodeType::Peer),
            node("b", NodeType::Peer),
        ]);
        let links = vec![
            MeshLink::validated("a", "p", 5, 100),
            MeshLink::validated("p", "b", 5, 100),
        ];
        let record = best_path(&nodes, &links, "a", "b").unwrap();
        assert_eq!(record.path, vec!["a", "b"]);
    }

    #[test]
    fn offline_endpoint_has_no_path() {
        let mut b = node("b", NodeType::Peer);
        b.is_online = false;
        let nodes = graph(vec![node("a", NodeType::Peer), b]);
        assert!(best_path(&nodes, &[], "a", "b").is_none());
        assert!(best_path(&nodes, &[], "a", "a").is_none());
    }
}
