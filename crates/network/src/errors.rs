//! Mesh networking error types

use meshnet_types::TransitionError;
use thiserror::Error;

/// Errors surfaced by the mesh components.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Node registration failed: {0}")]
    Registration(String),

    #[error("No route available to {target}: {reason}")]
    RouteUnavailable { target: String, reason: String },

    #[error("No route between {source_identity} and {destination_identity}")]
    NoRoute {
        source_identity: String,
        destination_identity: String,
    },

    #[error("Connection establishment failed: {0}")]
    ConnectionEstablishment(String),

    #[error("Connection not found: {connection_id}")]
    NotFound { connection_id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Connection table full ({max} connections)")]
    CapacityExhausted { max: usize },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl MeshError {
    pub fn persistence(err: anyhow::Error) -> Self {
        MeshError::Persistence(format!("{err:#}"))
    }

    /// Map a resolver failure between two identities. Missing endpoints and
    /// missing paths become `NoRoute`; everything else is `RouteUnavailable`.
    pub fn from_routing(
        err: RoutingError,
        source_identity: &str,
        destination_identity: &str,
    ) -> Self {
        match err {
            RoutingError::UnknownIdentity { .. } | RoutingError::NoPath { .. } => {
                MeshError::NoRoute {
                    source_identity: source_identity.to_string(),
                    destination_identity: destination_identity.to_string(),
                }
            }
            other => MeshError::RouteUnavailable {
                target: destination_identity.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::RouteUnavailable { .. }
                | MeshError::NoRoute { .. }
                | MeshError::ConnectionEstablishment(_)
                | MeshError::Persistence(_)
                | MeshError::CapacityExhausted { .. }
        )
    }
}

/// Route provider errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Routing service timed out")]
    Timeout,

    #[error("Routing service network error: {0}")]
    Network(String),

    #[error("Routing service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed route: {0}")]
    Malformed(String),

    #[error("No online node for {identity}")]
    UnknownIdentity { identity: String },

    #[error("No path between {source_identity} and {destination_identity}")]
    NoPath {
        source_identity: String,
        destination_identity: String,
    },

    #[error("Route store error: {0}")]
    Store(String),

    #[error("Invalid routing configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for RoutingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RoutingError::Timeout
        } else {
            RoutingError::Network(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for RoutingError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RoutingError::Timeout
    }
}

impl From<url::ParseError> for RoutingError {
    fn from(err: url::ParseError) -> Self {
        RoutingError::Config(err.to_string())
    }
}

/// Transport session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Session setup failed: {0}")]
    Session(String),

    #[error("Control channel error: {0}")]
    Channel(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Session closed")]
    Closed,
}

/// Signaling relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("No next hop for route {route_id}")]
    NoNextHop { route_id: String },

    #[error("Signaling delivery failed: {0}")]
    Delivery(String),
}

/// Control protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_errors_map_to_mesh_errors() {
        let missing = MeshError::from_routing(
            RoutingError::UnknownIdentity {
                identity: "carol".into(),
            },
            "alice",
            "carol",
        );
        assert!(matches!(missing, MeshError::NoRoute { .. }));
        assert!(missing.is_retryable());

        let timeout = MeshError::from_routing(RoutingError::Timeout, "alice", "carol");
        assert!(matches!(
            timeout,
            MeshError::RouteUnavailable { ref target, .. } if target == "carol"
        ));
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = MeshError::NotFound {
            connection_id: "c1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Connection not found: c1");
    }
}
