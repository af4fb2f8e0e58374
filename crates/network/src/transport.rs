//! Transport session contracts.
//!
//! A `PeerTransport` builds `TransportSession`s configured with STUN servers
//! for reflexive candidates and TURN servers (with credentials) for relayed
//! candidates. The connection manager only talks to these traits, so the
//! concrete stack can be `WebRtcTransport` or the in-process
//! `MemoryTransport`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::TransportError;

/// One STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub stun_servers: Vec<IceServer>,
    pub turn_servers: Vec<IceServer>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            turn_servers: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// All servers in the order they are handed to the ICE agent
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .chain(self.turn_servers.iter())
            .cloned()
            .collect()
    }
}

/// Connectivity state reported by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

pub type StateHandler = Box<dyn Fn(TransportState) + Send + Sync>;
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type OpenHandler = Box<dyn Fn(&dyn ControlChannel) + Send + Sync>;

/// Factory for transport sessions
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_session(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// A single negotiated session with one remote peer
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Handlers run on the transport's own context.
    fn on_state_change(&self, handler: StateHandler);

    fn on_local_candidate(&self, handler: CandidateHandler);

    async fn create_control_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release every resource held by the session. Safe to call twice.
    fn close(&self);
}

/// Auxiliary ordered channel carrying mesh bookkeeping
pub trait ControlChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Run `handler` once the channel opens, or immediately if already open.
    fn on_open(&self, handler: OpenHandler);

    /// Queue `payload` for delivery.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    fn close(&self);
}
