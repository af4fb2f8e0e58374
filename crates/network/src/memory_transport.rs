//! In-process transport used by tests and local loopback runs.
//!
//! Sessions never touch the network. State changes and local candidates are
//! driven explicitly through `simulate_state` and `emit_local_candidate`, and
//! failures can be injected per stage.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::errors::TransportError;
use crate::transport::{
    CandidateHandler, ControlChannel, IceCandidate, OpenHandler, PeerTransport, SdpKind,
    SessionDescription, StateHandler, TransportConfig, TransportSession, TransportState,
};

type SharedStateHandler = Arc<dyn Fn(TransportState) + Send + Sync>;
type SharedCandidateHandler = Arc<dyn Fn(IceCandidate) + Send + Sync>;
type SharedOpenHandler = Arc<dyn Fn(&dyn ControlChannel) + Send + Sync>;

/// Which stage of session construction should fail
#[derive(Debug, Default)]
struct FailurePlan {
    session: AtomicBool,
    channel: AtomicBool,
    offer: AtomicBool,
}

/// Transport whose sessions live entirely in memory
#[derive(Default)]
pub struct MemoryTransport {
    sessions: RwLock<HashMap<String, Arc<MemorySession>>>,
    order: RwLock<Vec<String>>,
    failures: Arc<FailurePlan>,
    next_id: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_session_creation(&self, fail: bool) {
        self.failures.session.store(fail, Ordering::SeqCst);
    }

    pub fn fail_control_channel(&self, fail: bool) {
        self.failures.channel.store(fail, Ordering::SeqCst);
    }

    pub fn fail_offer(&self, fail: bool) {
        self.failures.offer.store(fail, Ordering::SeqCst);
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<MemorySession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Most recently created session
    pub fn last_session(&self) -> Option<Arc<MemorySession>> {
        let id = self.order.read().last().cloned()?;
        self.session(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_session(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        if self.failures.session.load(Ordering::SeqCst) {
            return Err(TransportError::Session("injected session failure".into()));
        }
        let id = format!("mem-session-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = Arc::new(MemorySession::new(
            id.clone(),
            config.clone(),
            self.failures.clone(),
        ));
        self.sessions.write().insert(id.clone(), session.clone());
        self.order.write().push(id);
        Ok(session)
    }
}

/// A loopback session
pub struct MemorySession {
    id: String,
    config: TransportConfig,
    failures: Arc<FailurePlan>,
    state: RwLock<TransportState>,
    state_handlers: RwLock<Vec<SharedStateHandler>>,
    candidate_handlers: RwLock<Vec<SharedCandidateHandler>>,
    channels: RwLock<Vec<Arc<MemoryChannel>>>,
    local_description: RwLock<Option<SessionDescription>>,
    remote_description: RwLock<Option<SessionDescription>>,
    remote_candidates: RwLock<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn new(id: String, config: TransportConfig, failures: Arc<FailurePlan>) -> Self {
        Self {
            id,
            config,
            failures,
            state: RwLock::new(TransportState::New),
            state_handlers: RwLock::new(Vec::new()),
            candidate_handlers: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            local_description: RwLock::new(None),
            remote_description: RwLock::new(None),
            remote_candidates: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.read().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.read().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.read().clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        self.channels
            .read()
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    /// Drive a state change as the ICE agent would. Reaching `connected`
    /// opens every control channel.
    pub fn simulate_state(&self, state: TransportState) {
        *self.state.write() = state;
        debug!(session_id = %self.id, %state, "Simulated transport state");

        let handlers: Vec<_> = self.state_handlers.read().clone();
        for handler in handlers {
            handler(state);
        }

        if state == TransportState::Connected {
            let channels: Vec<_> = self.channels.read().clone();
            for channel in channels {
                channel.open();
            }
        }
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let handlers: Vec<_> = self.candidate_handlers.read().clone();
        for handler in handlers {
            handler(candidate.clone());
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn on_state_change(&self, handler: StateHandler) {
        self.state_handlers.write().push(Arc::from(handler));
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        self.candidate_handlers.write().push(Arc::from(handler));
    }

    async fn create_control_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlChannel>, TransportError> {
        self.ensure_open()?;
        if self.failures.channel.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("injected channel failure".into()));
        }
        let channel = Arc::new(MemoryChannel::new(label));
        self.channels.write().push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.failures.offer.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("injected offer failure".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\n", self.id),
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        *self.local_description.write() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        *self.remote_description.write() = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.remote_candidates.write().push(candidate);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write() = TransportState::Closed;
        let channels: Vec<_> = self.channels.read().clone();
        for channel in channels {
            channel.close();
        }
    }
}

/// Loopback control channel that records what was sent
pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    open_handlers: RwLock<Vec<SharedOpenHandler>>,
    sent: RwLock<Vec<Vec<u8>>>,
}

impl MemoryChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            open_handlers: RwLock::new(Vec::new()),
            sent: RwLock::new(Vec::new()),
        }
    }

    fn open(&self) {
        if self.closed.load(Ordering::SeqCst) || self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<_> = self.open_handlers.read().clone();
        for handler in handlers {
            handler(self);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Payloads sent so far, oldest first
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }
}

impl ControlChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn on_open(&self, handler: OpenHandler) {
        let handler: SharedOpenHandler = Arc::from(handler);
        if self.is_open() {
            handler(self);
        }
        self.open_handlers.write().push(handler);
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Channel(format!(
                "channel {} is not open",
                self.label
            )));
        }
        self.sent.write().push(payload.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_state_handlers_fire() {
        let transport = MemoryTransport::new();
        let session = transport
            .create_session(&TransportConfig::default())
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        session.on_state_change(Box::new(move |state| {
            if state == TransportState::Connected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let memory = transport.session(session.session_id()).unwrap();
        memory.simulate_state(TransportState::Checking);
        memory.simulate_state(TransportState::Connected);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_opens_on_connect() {
        let transport = MemoryTransport::new();
        let session = transport
            .create_session(&TransportConfig::default())
            .await
            .unwrap();
        let channel = session.create_control_channel("ctl").await.unwrap();
        assert!(channel.send(b"early").is_err());

        channel.on_open(Box::new(|ch| {
            ch.send(b"hello").unwrap();
        }));
        transport.last_session().unwrap().simulate_state(TransportState::Connected);

        let memory = transport.last_session().unwrap().channel("ctl").unwrap();
        assert_eq!(memory.sent(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_injected_failures_and_close() {
        let transport = MemoryTransport::new();
        transport.fail_session_creation(true);
        assert!(transport
            .create_session(&TransportConfig::default())
            .await
            .is_err());

        transport.fail_session_creation(false);
        transport.fail_offer(true);
        let session = transport
            .create_session(&TransportConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            session.create_offer().await,
            Err(TransportError::Negotiation(_))
        ));

        session.close();
        session.close();
        assert!(transport.last_session().unwrap().is_closed());
        assert_eq!(
            session.create_control_channel("x").await.err(),
            Some(TransportError::Closed)
        );
    }
}
