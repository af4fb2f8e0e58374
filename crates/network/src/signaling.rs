//! Signaling relay contract.
//!
//! Offers, answers and candidates travel hop by hop along a resolved route.
//! The relay wire protocol lives elsewhere; this crate only needs to hand a
//! message to the next hop and be told about messages addressed to it.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::SignalingError;
use crate::transport::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignalingPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub connection_id: String,
    pub route_id: String,
    pub from_node_id: String,
    pub payload: SignalingPayload,
}

pub type SignalHandler = Box<dyn Fn(SignalingMessage) + Send + Sync>;

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn send(&self, message: SignalingMessage, next_hop: &str)
        -> Result<(), SignalingError>;

    fn on_receive(&self, handler: SignalHandler);
}

/// Relay that records outbound messages and lets callers inject inbound ones.
#[derive(Default)]
pub struct RecordingRelay {
    sent: RwLock<Vec<(String, SignalingMessage)>>,
    handlers: RwLock<Vec<Arc<dyn Fn(SignalingMessage) + Send + Sync>>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(next_hop, message)` pairs in send order
    pub fn sent(&self) -> Vec<(String, SignalingMessage)> {
        self.sent.read().clone()
    }

    /// Deliver `message` to every registered handler.
    pub fn deliver(&self, message: SignalingMessage) {
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            handler(message.clone());
        }
    }
}

#[async_trait]
impl SignalingRelay for RecordingRelay {
    async fn send(
        &self,
        message: SignalingMessage,
        next_hop: &str,
    ) -> Result<(), SignalingError> {
        self.sent.write().push((next_hop.to_string(), message));
        Ok(())
    }

    fn on_receive(&self, handler: SignalHandler) {
        self.handlers.write().push(Arc::from(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offer(connection_id: &str) -> SignalingMessage {
        SignalingMessage {
            connection_id: connection_id.to_string(),
            route_id: "route-1".into(),
            from_node_id: "node-a".into(),
            payload: SignalingPayload::Offer(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            }),
        }
    }

    #[test]
    fn test_recording_relay_keeps_send_order() {
        let relay = RecordingRelay::new();
        tokio_test::block_on(relay.send(offer("c1"), "relay-b")).unwrap();
        tokio_test::block_on(relay.send(offer("c2"), "relay-c")).unwrap();

        let sent = relay.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "relay-b");
        assert_eq!(sent[1].1.connection_id, "c2");
    }

    #[test]
    fn test_delivery_reaches_every_handler() {
        let relay = RecordingRelay::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let seen = seen.clone();
            relay.on_receive(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }

        relay.deliver(offer("c1"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_payload_wire_shape() {
        let json = serde_json::to_value(offer("c1")).unwrap();
        assert_eq!(json["payload"]["type"], "offer");
        assert_eq!(json["payload"]["data"]["kind"], "offer");
    }
}
