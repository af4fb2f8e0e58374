//! MeshNet Network Core
//!
//! Peer mesh networking for media sessions: nodes register themselves,
//! resolve routes to other identities through an AI routing service or the
//! local path finder, and hold direct transport sessions along those routes.
//!
//! ## Modules
//! - `registry`: Local node registration, heartbeats and liveness
//! - `routing`: Two-tier route resolution (AI service, then local path finding)
//! - `connection`: Peer session lifecycle over a pluggable transport
//! - `transport`: Transport session and control channel contracts
//! - `webrtc_transport`: ICE/DTLS sessions over the `webrtc` stack
//! - `memory_transport`: In-process transport for tests and loopback nodes
//! - `signaling`: Hop-by-hop offer/answer/candidate relay contract
//! - `protocol`: Control channel message format
//! - `health`: Heartbeat publication and stale connection sweeps
//! - `reputation`: Abuse reports and reputation feedback
//! - `metrics`: Counters and latency tracking for the mesh
//! - `service`: Assembly of the components into a running node

pub mod connection;
pub mod errors;
pub mod health;
pub mod memory_transport;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod reputation;
pub mod routing;
pub mod service;
pub mod signaling;
pub mod transport;
pub mod webrtc_transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

// Registry & routing
pub use registry::{LocalNode, NodeDefaults, NodeRegistry};
pub use routing::{
    AiRoutingClient, RouteProvider, RouteRequest, RouteResolver, RoutingConfig,
    StoreRouteProvider,
};

// Connections & transport
pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionTable};
pub use memory_transport::{MemoryChannel, MemorySession, MemoryTransport};
pub use protocol::{ControlMessage, ControlPayload, CONTROL_CHANNEL_LABEL, PROTOCOL_VERSION};
pub use signaling::{RecordingRelay, SignalingMessage, SignalingPayload, SignalingRelay};
pub use transport::{
    ControlChannel, IceCandidate, IceServer, PeerTransport, SdpKind, SessionDescription,
    TransportConfig, TransportSession, TransportState,
};
pub use webrtc_transport::{WebRtcChannel, WebRtcSession, WebRtcTransport};

// Reputation, health & metrics
pub use health::{HealthCheckConfig, HealthMonitor, HealthTasks};
pub use metrics::{MeshMetrics, MeshMetricsSnapshot};
pub use reputation::{NodeReputationStats, ReputationConfig, ReputationTracker};

// Errors & service
pub use errors::{MeshError, ProtocolError, RoutingError, SignalingError, TransportError};
pub use service::{MeshConfig, MeshService};
