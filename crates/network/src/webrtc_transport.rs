//! WebRTC transport.
//!
//! Each session is an `RTCPeerConnection` whose ICE agent is fed the
//! configured STUN servers (reflexive candidates) and TURN servers with
//! credentials (relayed candidates). The control channel is an ordered
//! data channel. Writes are queued to a per-channel task so `send` stays
//! synchronous.

use async_trait::async_trait;
use bytes::Bytes;
use meshnet_types::generate_id;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::errors::TransportError;
use crate::transport::{
    CandidateHandler, ControlChannel, IceCandidate, IceServer, OpenHandler, PeerTransport,
    SdpKind, SessionDescription, StateHandler, TransportConfig, TransportSession,
    TransportState,
};

/// Map configured servers onto the ICE agent's server list, STUN first.
pub fn rtc_ice_servers(config: &TransportConfig) -> Vec<RTCIceServer> {
    config.ice_servers().iter().map(rtc_ice_server).collect()
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

pub fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Checking,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Negotiation(e.to_string()))
}

/// Transport backed by the `webrtc` stack
pub struct WebRtcTransport {
    api: API,
}

impl WebRtcTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Session(format!("codec registration: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Session(format!("interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_session(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let configuration = RTCConfiguration {
            ice_servers: rtc_ice_servers(config),
            ..Default::default()
        };
        let peer = self
            .api
            .new_peer_connection(configuration)
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?;

        let session = WebRtcSession {
            session_id: generate_id(),
            peer: Arc::new(peer),
            closed: AtomicBool::new(false),
        };
        debug!(
            session_id = %session.session_id,
            stun = config.stun_servers.len(),
            turn = config.turn_servers.len(),
            "WebRTC session created"
        );
        Ok(Arc::new(session))
    }
}

pub struct WebRtcSession {
    session_id: String,
    peer: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn on_state_change(&self, handler: StateHandler) {
        self.peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(transport_state(state));
                Box::pin(async {})
            }));
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        self.peer
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => handler(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => warn!(error = %e, "Unserializable local candidate"),
                    }
                }
                Box::pin(async {})
            }));
    }

    async fn create_control_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(WebRtcChannel::start(label, channel))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer
            .set_local_description(rtc_description(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer
            .set_remote_description(rtc_description(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.peer.clone();
        let session_id = self.session_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = peer.close().await {
                        warn!(session_id = %session_id, error = %e, "Peer connection close failed");
                    }
                });
            }
            Err(_) => warn!(session_id = %session_id, "No runtime to close peer connection on"),
        }
    }
}

/// Ordered data channel used for mesh control messages
pub struct WebRtcChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    me: Weak<WebRtcChannel>,
}

impl WebRtcChannel {
    /// Wrap `inner` and start its writer task. Must run inside a runtime.
    fn start(label: &str, inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = inner.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = writer.send(&payload).await {
                    warn!(label = %writer.label(), error = %e, "Control channel write failed");
                }
            }
        });

        Arc::new_cyclic(|me| Self {
            label: label.to_string(),
            inner,
            outbound: Mutex::new(Some(tx)),
            me: me.clone(),
        })
    }
}

impl ControlChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn on_open(&self, handler: OpenHandler) {
        if self.inner.ready_state() == RTCDataChannelState::Open {
            handler(self);
            return;
        }
        let me = self.me.clone();
        self.inner.on_open(Box::new(move || {
            if let Some(channel) = me.upgrade() {
                handler(channel.as_ref());
            }
            Box::pin(async {})
        }));
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(TransportError::Closed)?;
        sender
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        // dropping the sender ends the writer task
        if self.outbound.lock().take().is_none() {
            return;
        }
        let inner = self.inner.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = inner.close().await {
                    debug!(label = %inner.label(), error = %e, "Data channel close failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_carry_turn_credentials() {
        let config = TransportConfig {
            stun_servers: vec![IceServer::stun("stun:stun.example.net:3478")],
            turn_servers: vec![IceServer::turn("turn:turn.example.net:3478", "mesh", "secret")],
        };

        let servers = rtc_ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.net:3478"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].urls, vec!["turn:turn.example.net:3478"]);
        assert_eq!(servers[1].username, "mesh");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn peer_states_map_onto_transport_states() {
        assert_eq!(transport_state(RTCPeerConnectionState::New), TransportState::New);
        assert_eq!(
            transport_state(RTCPeerConnectionState::Connecting),
            TransportState::Checking
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Disconnected),
            TransportState::Disconnected
        );
        assert_eq!(transport_state(RTCPeerConnectionState::Failed), TransportState::Failed);
        assert_eq!(transport_state(RTCPeerConnectionState::Closed), TransportState::Closed);
    }

    #[tokio::test]
    async fn offer_advertises_control_channel() {
        let transport = WebRtcTransport::new().unwrap();
        let config = TransportConfig {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        };
        let session = transport.create_session(&config).await.unwrap();
        let channel = session.create_control_channel("mesh-control").await.unwrap();
        assert_eq!(channel.label(), "mesh-control");

        let offer = session.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=application"));
        session.set_local_description(offer).await.unwrap();

        channel.close();
        assert!(matches!(channel.send(b"late"), Err(TransportError::Closed)));
        session.close();
        session.close();
    }

    #[tokio::test]
    async fn malformed_remote_description_is_rejected() {
        let transport = WebRtcTransport::new().unwrap();
        let session = transport
            .create_session(&TransportConfig::default())
            .await
            .unwrap();

        let err = session
            .set_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "not sdp".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
        session.close();
    }
}
