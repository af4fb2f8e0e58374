//! MeshNet shared data model.
//!
//! Every crate in the workspace speaks in terms of these records:
//! - `node`: the mesh node record, capacity, location and capability flags
//! - `route`: resolved paths between two nodes and the links they walk
//! - `connection`: peer connection records and their lifecycle graph
//! - `abuse`: abuse reports filed against nodes
//! - `reputation`: score policy, trust thresholds and the delta ledger

pub mod abuse;
pub mod connection;
pub mod node;
pub mod reputation;
pub mod route;

pub use abuse::*;
pub use connection::*;
pub use node::*;
pub use reputation::*;
pub use route::*;

/// Generate a fresh opaque identifier for nodes, routes, connections and reports.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
