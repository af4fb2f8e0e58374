//! Control-channel protocol for MeshNet sessions
//!
//! Every session opens a dedicated `mesh-control` channel next to the media
//! tracks. The first message on it is a handshake naming the local node,
//! identity, connection and route so the remote side can correlate the
//! session with its own bookkeeping.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Control protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Label of the control channel opened on every session
pub const CONTROL_CHANNEL_LABEL: &str = "mesh-control";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    Handshake {
        identity: String,
        connection_id: String,
        route_id: String,
    },
    HandshakeAck {
        connection_id: String,
    },
}

/// Envelope for every control-channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub version: u32,
    pub sender_node_id: String,
    pub timestamp: i64,
    pub payload: ControlPayload,
}

impl ControlMessage {
    pub fn new(sender_node_id: impl Into<String>, payload: ControlPayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender_node_id: sender_node_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
            payload,
        }
    }

    pub fn handshake(
        node_id: &str,
        identity: &str,
        connection_id: &str,
        route_id: &str,
    ) -> Self {
        Self::new(
            node_id,
            ControlPayload::Handshake {
                identity: identity.to_string(),
                connection_id: connection_id.to_string(),
                route_id: route_id.to_string(),
            },
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(data)?;
        if message.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(message.version));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_encoding() {
        let message = ControlMessage::handshake("node-a", "alice", "conn-1", "route-1");
        let bytes = message.encode().unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["payload"]["type"], "handshake");
        assert_eq!(json["payload"]["connection_id"], "conn-1");

        assert_eq!(ControlMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut message = ControlMessage::new(
            "node-a",
            ControlPayload::HandshakeAck {
                connection_id: "c".into(),
            },
        );
        message.version = 99;
        let bytes = serde_json::to_vec(&message).unwrap();

        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(99))
        ));
    }
}
