//! Peer connection management for MeshNet
//!
//! Every live session is tracked in one lock-guarded table keyed by
//! connection id. All status changes, whether they come from transport
//! callbacks or from explicit termination, go through `ConnectionTable::apply`.
//! Route resolution, store writes and transport teardown always happen with
//! the table lock released.

use chrono::{DateTime, Utc};
use meshnet_storage::MeshStore;
use meshnet_types::{
    generate_id, ConnectionStatus, MeshLink, MeshRoute, P2PConnection,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::errors::MeshError;
use crate::metrics::MeshMetrics;
use crate::protocol::{ControlMessage, CONTROL_CHANNEL_LABEL};
use crate::registry::LocalNode;
use crate::reputation::ReputationTracker;
use crate::routing::RouteResolver;
use crate::signaling::{SignalingMessage, SignalingPayload, SignalingRelay};
use crate::transport::{
    ControlChannel, PeerTransport, TransportConfig, TransportSession, TransportState,
};

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_connections: usize,
    pub transport: TransportConfig,
    pub control_channel_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            transport: TransportConfig::default(),
            control_channel_label: CONTROL_CHANNEL_LABEL.to_string(),
        }
    }
}

/// Live connection with the transport resources it owns
struct ConnectionEntry {
    record: P2PConnection,
    route: MeshRoute,
    session: Option<Arc<dyn TransportSession>>,
    control: Option<Arc<dyn ControlChannel>>,
}

/// Something that can move a connection along its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Transport(TransportState),
    Terminate,
}

/// Result of applying an event to the table
enum Applied {
    Unchanged,
    Updated {
        previous: ConnectionStatus,
        record: P2PConnection,
        route: MeshRoute,
    },
    Removed {
        previous: ConnectionStatus,
        entry: ConnectionEntry,
    },
}

/// Table of live connections shared by the manager, the registry and
/// transport callbacks
#[derive(Clone, Default)]
pub struct ConnectionTable {
    entries: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, connection_id: &str) -> Option<P2PConnection> {
        self.entries
            .read()
            .get(connection_id)
            .map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<P2PConnection> {
        self.entries
            .read()
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Connections older than `threshold` that are not `active`
    pub fn stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<P2PConnection> {
        self.entries
            .read()
            .values()
            .filter(|e| e.record.status != ConnectionStatus::Active)
            .filter(|e| e.record.age(now) > threshold)
            .map(|e| e.record.clone())
            .collect()
    }

    fn insert(&self, entry: ConnectionEntry, max: usize) -> Result<(), MeshError> {
        let mut entries = self.entries.write();
        if entries.len() >= max {
            return Err(MeshError::CapacityExhausted { max });
        }
        entries.insert(entry.record.connection_id.clone(), entry);
        Ok(())
    }

    fn remove(&self, connection_id: &str) -> Option<ConnectionEntry> {
        self.entries.write().remove(connection_id)
    }

    fn attach_session(&self, connection_id: &str, session: Arc<dyn TransportSession>) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(connection_id) {
            Some(entry) => {
                entry.record.session_id = Some(session.session_id().to_string());
                entry.session = Some(session);
                true
            }
            None => false,
        }
    }

    fn attach_control(&self, connection_id: &str, control: Arc<dyn ControlChannel>) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(connection_id) {
            Some(entry) => {
                entry.record.control_channel = Some(control.label().to_string());
                entry.control = Some(control);
                true
            }
            None => false,
        }
    }

    fn session(&self, connection_id: &str) -> Option<Arc<dyn TransportSession>> {
        self.entries
            .read()
            .get(connection_id)
            .and_then(|e| e.session.clone())
    }

    fn route(&self, connection_id: &str) -> Option<MeshRoute> {
        self.entries
            .read()
            .get(connection_id)
            .map(|e| e.route.clone())
    }

    /// The single mutation path for connection status.
    fn apply(
        &self,
        connection_id: &str,
        event: ConnectionEvent,
        at: DateTime<Utc>,
    ) -> Result<Applied, MeshError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(connection_id)
            .ok_or_else(|| MeshError::NotFound {
                connection_id: connection_id.to_string(),
            })?;

        let current = entry.record.status;
        let next = match event {
            ConnectionEvent::Terminate => ConnectionStatus::Terminated,
            ConnectionEvent::Transport(state) => match state {
                TransportState::New | TransportState::Checking => return Ok(Applied::Unchanged),
                TransportState::Connected => ConnectionStatus::Active,
                TransportState::Disconnected => ConnectionStatus::Disconnected,
                TransportState::Closed => ConnectionStatus::Closed,
                // only a session that never came up is recorded as failed
                TransportState::Failed if current == ConnectionStatus::Establishing => {
                    ConnectionStatus::Failed
                }
                TransportState::Failed => ConnectionStatus::Terminated,
            },
        };
        if next == current {
            return Ok(Applied::Unchanged);
        }

        let previous = entry.record.transition(next, at)?;
        if next.is_terminal() {
            let entry = entries
                .remove(connection_id)
                .ok_or_else(|| MeshError::NotFound {
                    connection_id: connection_id.to_string(),
                })?;
            return Ok(Applied::Removed { previous, entry });
        }

        Ok(Applied::Updated {
            previous,
            record: entry.record.clone(),
            route: entry.route.clone(),
        })
    }
}

struct Shared {
    config: ConnectionConfig,
    local: LocalNode,
    table: ConnectionTable,
    resolver: Arc<RouteResolver>,
    transport: Arc<dyn PeerTransport>,
    signaling: RwLock<Option<Arc<dyn SignalingRelay>>>,
    store: Arc<dyn MeshStore>,
    reputation: Arc<ReputationTracker>,
    metrics: Arc<MeshMetrics>,
}

/// Establishes, tracks and tears down peer sessions
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConnectionConfig,
        local: LocalNode,
        table: ConnectionTable,
        resolver: Arc<RouteResolver>,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn MeshStore>,
        reputation: Arc<ReputationTracker>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                local,
                table,
                resolver,
                transport,
                signaling: RwLock::new(None),
                store,
                reputation,
                metrics,
            }),
        }
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.shared.table
    }

    /// Route offers and candidates through `relay`, and apply what it
    /// delivers to the matching sessions.
    pub fn attach_signaling(&self, relay: Arc<dyn SignalingRelay>) {
        let weak = Arc::downgrade(&self.shared);
        relay.on_receive(Box::new(move |message| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let connection_id = message.connection_id.clone();
                        if let Err(e) = shared.handle_signaling(message).await {
                            warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "Signaling message rejected"
                            );
                        }
                    });
                }
                Err(_) => warn!("Signaling message dropped outside a runtime"),
            }
        }));
        *self.shared.signaling.write() = Some(relay);
    }

    /// Resolve a route to `target_identity` and start a session along it.
    pub async fn establish_connection(
        &self,
        target_identity: &str,
        require_advanced_feature: bool,
    ) -> Result<P2PConnection, MeshError> {
        let shared = &self.shared;
        shared.metrics.record_connection_requested();

        let route = shared
            .resolver
            .request_route_from(
                Some(&shared.local.node_id),
                &shared.local.identity,
                target_identity,
                require_advanced_feature,
            )
            .await
            .map_err(|e| MeshError::RouteUnavailable {
                target: target_identity.to_string(),
                reason: e.to_string(),
            })?;

        let connection_id = generate_id();
        let record = P2PConnection::establishing(
            connection_id.clone(),
            shared.local.node_id.clone(),
            route.destination_node_id.clone(),
            route.route_id.clone(),
        );
        shared.table.insert(
            ConnectionEntry {
                record,
                route: route.clone(),
                session: None,
                control: None,
            },
            shared.config.max_connections,
        )?;
        info!(
            connection_id = %connection_id,
            target = target_identity,
            route_id = %route.route_id,
            hops = route.hop_count(),
            status = %ConnectionStatus::Establishing,
            "Connection establishing"
        );

        if let Err(e) = Shared::build_session(shared, &connection_id, &route).await {
            // roll back: nothing half-built stays in the table
            if let Some(entry) = shared.table.remove(&connection_id) {
                shared.release_resources(&entry);
            }
            shared.metrics.record_connection_failed();
            warn!(connection_id = %connection_id, error = %e, "Connection establishment failed");
            return Err(match e {
                MeshError::ConnectionEstablishment(_) => e,
                other => MeshError::ConnectionEstablishment(other.to_string()),
            });
        }

        shared
            .table
            .get(&connection_id)
            .ok_or(MeshError::NotFound { connection_id })
    }

    /// Forcefully terminate a connection. A second call for the same id
    /// reports `NotFound`.
    pub fn terminate_connection(&self, connection_id: &str) -> Result<P2PConnection, MeshError> {
        self.shared.teardown(connection_id, "terminated on request")
    }

    /// Terminate every live connection, returning how many were torn down.
    pub fn terminate_all(&self) -> usize {
        let mut terminated = 0;
        for connection_id in self.shared.table.ids() {
            match self.shared.teardown(&connection_id, "shutdown") {
                Ok(_) => terminated += 1,
                Err(MeshError::NotFound { .. }) => {}
                Err(e) => warn!(connection_id = %connection_id, error = %e, "Teardown failed"),
            }
        }
        terminated
    }

    /// Terminate connections the stale sweep considers abandoned.
    pub fn reap_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        for stale in self.shared.table.stale(now, threshold) {
            let age_secs = stale.age(now).num_seconds();
            let connection_id = stale.connection_id;
            match self.shared.teardown(&connection_id, "stale") {
                Ok(_) => {
                    info!(
                        connection_id = %connection_id,
                        status = %stale.status,
                        age_secs,
                        "Stale connection cleaned up"
                    );
                    self.shared.metrics.record_connection_reaped();
                    reaped.push(connection_id);
                }
                Err(MeshError::NotFound { .. }) => {}
                Err(e) => warn!(connection_id = %connection_id, error = %e, "Stale cleanup failed"),
            }
        }
        reaped
    }

    /// Apply an answer or candidate delivered by the signaling relay.
    pub async fn handle_signaling(&self, message: SignalingMessage) -> Result<(), MeshError> {
        self.shared.handle_signaling(message).await
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<P2PConnection> {
        self.shared.table.get(connection_id)
    }

    pub fn list_connections(&self) -> Vec<P2PConnection> {
        self.shared.table.list()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.table.len()
    }
}

fn setup_error(stage: &str, err: impl std::fmt::Display) -> MeshError {
    MeshError::ConnectionEstablishment(format!("{stage}: {err}"))
}

impl Shared {
    fn signaling(&self) -> Option<Arc<dyn SignalingRelay>> {
        self.signaling.read().clone()
    }

    async fn build_session(
        shared: &Arc<Shared>,
        connection_id: &str,
        route: &MeshRoute,
    ) -> Result<(), MeshError> {
        let session = shared
            .transport
            .create_session(&shared.config.transport)
            .await
            .map_err(|e| setup_error("transport session", e))?;
        if !shared.table.attach_session(connection_id, session.clone()) {
            session.close();
            return Err(MeshError::ConnectionEstablishment(
                "connection removed during setup".into(),
            ));
        }

        let weak = Arc::downgrade(shared);
        let id = connection_id.to_string();
        session.on_state_change(Box::new(move |state| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_state(&id, state);
            }
        }));

        let weak: Weak<Shared> = Arc::downgrade(shared);
        let id = connection_id.to_string();
        session.on_local_candidate(Box::new(move |candidate| {
            if let Some(shared) = weak.upgrade() {
                shared.forward_signal(&id, SignalingPayload::Candidate(candidate));
            }
        }));

        let control = session
            .create_control_channel(&shared.config.control_channel_label)
            .await
            .map_err(|e| setup_error("control channel", e))?;
        let handshake = ControlMessage::handshake(
            &shared.local.node_id,
            &shared.local.identity,
            connection_id,
            &route.route_id,
        );
        let id = connection_id.to_string();
        control.on_open(Box::new(move |channel| {
            let sent = handshake
                .encode()
                .map_err(|e| e.to_string())
                .and_then(|bytes| channel.send(&bytes).map_err(|e| e.to_string()));
            match sent {
                Ok(()) => debug!(connection_id = %id, "Control handshake sent"),
                Err(e) => warn!(connection_id = %id, error = %e, "Control handshake failed"),
            }
        }));
        if !shared.table.attach_control(connection_id, control.clone()) {
            control.close();
            return Err(MeshError::ConnectionEstablishment(
                "connection removed during setup".into(),
            ));
        }

        let offer = session
            .create_offer()
            .await
            .map_err(|e| setup_error("create offer", e))?;
        session
            .set_local_description(offer.clone())
            .await
            .map_err(|e| setup_error("set local description", e))?;

        if let Some(relay) = shared.signaling() {
            let next_hop = route
                .next_hop()
                .ok_or_else(|| MeshError::ConnectionEstablishment("route has no next hop".into()))?;
            let message = SignalingMessage {
                connection_id: connection_id.to_string(),
                route_id: route.route_id.clone(),
                from_node_id: shared.local.node_id.clone(),
                payload: SignalingPayload::Offer(offer),
            };
            relay
                .send(message, next_hop)
                .await
                .map_err(|e| setup_error("send offer", e))?;
            debug!(connection_id, next_hop = %next_hop, "Offer handed to signaling relay");
        }

        Ok(())
    }

    fn forward_signal(&self, connection_id: &str, payload: SignalingPayload) {
        let Some(relay) = self.signaling() else {
            return;
        };
        let Some(route) = self.table.route(connection_id) else {
            return;
        };
        let Some(next_hop) = route.next_hop().cloned() else {
            return;
        };
        let message = SignalingMessage {
            connection_id: connection_id.to_string(),
            route_id: route.route_id.clone(),
            from_node_id: self.local.node_id.clone(),
            payload,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = relay.send(message, &next_hop).await {
                        warn!(next_hop = %next_hop, error = %e, "Failed to forward signal");
                    }
                });
            }
            Err(_) => warn!(connection_id, "Signal dropped outside a runtime"),
        }
    }

    async fn handle_signaling(&self, message: SignalingMessage) -> Result<(), MeshError> {
        let session = self
            .table
            .session(&message.connection_id)
            .ok_or_else(|| MeshError::NotFound {
                connection_id: message.connection_id.clone(),
            })?;
        match message.payload {
            SignalingPayload::Answer(answer) => session
                .set_remote_description(answer)
                .await
                .map_err(|e| setup_error("apply answer", e)),
            SignalingPayload::Candidate(candidate) => session
                .add_remote_candidate(candidate)
                .await
                .map_err(|e| setup_error("apply candidate", e)),
            SignalingPayload::Offer(_) => {
                debug!(
                    connection_id = %message.connection_id,
                    from = %message.from_node_id,
                    "Ignoring offer for an outbound connection"
                );
                Ok(())
            }
        }
    }

    fn on_transport_state(&self, connection_id: &str, state: TransportState) {
        match self
            .table
            .apply(connection_id, ConnectionEvent::Transport(state), Utc::now())
        {
            Ok(Applied::Unchanged) => {}
            Ok(Applied::Updated {
                previous,
                record,
                route,
            }) => {
                info!(
                    connection_id,
                    from = %previous,
                    to = %record.status,
                    transport = %state,
                    "Connection status changed"
                );
                match record.status {
                    ConnectionStatus::Active if previous == ConnectionStatus::Establishing => {
                        self.metrics.record_connection_activated();
                        self.record_links(&route);
                        self.record_outcome(&record, true);
                    }
                    ConnectionStatus::Failed => {
                        self.metrics.record_connection_failed();
                        self.record_outcome(&record, false);
                        if let Err(e) = self.teardown(connection_id, "transport failed") {
                            debug!(connection_id, error = %e, "Failed connection already gone");
                        }
                    }
                    ConnectionStatus::Disconnected => {
                        warn!(connection_id, "Connection disconnected, awaiting recovery");
                    }
                    _ => {}
                }
            }
            Ok(Applied::Removed { previous, entry }) => {
                info!(
                    connection_id,
                    from = %previous,
                    to = %entry.record.status,
                    transport = %state,
                    "Connection ended by transport"
                );
                self.finish(entry);
            }
            Err(MeshError::NotFound { .. }) => {
                debug!(connection_id, transport = %state, "State change for unknown connection");
            }
            Err(e) => {
                warn!(
                    connection_id,
                    transport = %state,
                    error = %e,
                    "Ignoring transport state change"
                );
            }
        }
    }

    fn teardown(&self, connection_id: &str, reason: &str) -> Result<P2PConnection, MeshError> {
        match self
            .table
            .apply(connection_id, ConnectionEvent::Terminate, Utc::now())?
        {
            Applied::Removed { previous, entry } => {
                info!(
                    connection_id,
                    from = %previous,
                    to = %entry.record.status,
                    reason,
                    "Connection terminated"
                );
                let record = entry.record.clone();
                self.finish(entry);
                Ok(record)
            }
            // Terminated is terminal, so apply always removes
            Applied::Unchanged | Applied::Updated { .. } => Err(MeshError::NotFound {
                connection_id: connection_id.to_string(),
            }),
        }
    }

    /// Release transport resources and archive the final record.
    fn finish(&self, entry: ConnectionEntry) {
        self.release_resources(&entry);
        self.metrics.record_connection_terminated();
        if let Err(e) = self.store.archive_connection(&entry.record) {
            warn!(
                connection_id = %entry.record.connection_id,
                error = %e,
                "Failed to archive connection"
            );
        }
    }

    fn release_resources(&self, entry: &ConnectionEntry) {
        if let Some(control) = &entry.control {
            control.close();
        }
        if let Some(session) = &entry.session {
            session.close();
        }
    }

    fn record_links(&self, route: &MeshRoute) {
        let hops = route.hop_count().max(1) as u32;
        let latency = route.predicted_latency_ms / hops;
        for pair in route.path.windows(2) {
            let link = MeshLink::validated(
                pair[0].clone(),
                pair[1].clone(),
                latency,
                route.predicted_bandwidth_mbps,
            );
            if let Err(e) = self.store.record_link(&link) {
                warn!(from = %pair[0], to = %pair[1], error = %e, "Failed to record link");
            }
        }
    }

    fn record_outcome(&self, record: &P2PConnection, success: bool) {
        if let Err(e) = self.store.record_route_outcome(&record.route_id, success) {
            debug!(route_id = %record.route_id, error = %e, "Route outcome not recorded");
        }
        if let Err(e) = self
            .reputation
            .record_connection_outcome(&record.target_node_id, success)
        {
            debug!(
                node_id = %record.target_node_id,
                error = %e,
                "Reputation outcome not recorded"
            );
        }
    }
}
