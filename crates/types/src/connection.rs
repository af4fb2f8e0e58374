use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::NodeId;

/// Lifecycle status of a peer connection.
///
/// ```text
/// establishing -> active | failed
/// active       -> disconnected | closed | terminated
/// failed       -> terminated
/// disconnected -> active | terminated
/// ```
/// `closed` and `terminated` are terminal. A forced termination is accepted
/// from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Establishing,
    Active,
    Failed,
    Disconnected,
    Closed,
    Terminated,
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Closed | ConnectionStatus::Terminated)
    }

    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Closed | Terminated, _) => false,
            (_, Terminated) => true,
            (Establishing, Active | Failed) => true,
            (Active, Disconnected | Closed) => true,
            (Disconnected, Active) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Establishing => "establishing",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// A transport session between the local node and a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2PConnection {
    pub connection_id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub route_id: String,
    pub status: ConnectionStatus,
    pub established_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Opaque reference to the transport session.
    pub session_id: Option<String>,
    /// Label of the mesh control channel opened over the session.
    pub control_channel: Option<String>,
}

impl P2PConnection {
    /// New record in `establishing`.
    pub fn establishing(
        connection_id: impl Into<String>,
        source_node_id: impl Into<NodeId>,
        target_node_id: impl Into<NodeId>,
        route_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            route_id: route_id.into(),
            status: ConnectionStatus::Establishing,
            established_at: Utc::now(),
            terminated_at: None,
            session_id: None,
            control_channel: None,
        }
    }

    /// Move to `next`, stamping `terminated_at` on terminal statuses.
    pub fn transition(
        &mut self,
        next: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> Result<ConnectionStatus, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        if next.is_terminal() {
            self.terminated_at = Some(at);
        }
        Ok(previous)
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.established_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    fn conn() -> P2PConnection {
        P2PConnection::establishing("c1", "a", "b", "r1")
    }

    #[test]
    fn lifecycle_graph_matches_allowed_edges() {
        let allowed = [
            (Establishing, Active),
            (Establishing, Failed),
            (Establishing, Terminated),
            (Active, Disconnected),
            (Active, Closed),
            (Active, Terminated),
            (Failed, Terminated),
            (Disconnected, Active),
            (Disconnected, Terminated),
        ];
        let all = [Establishing, Active, Failed, Disconnected, Closed, Terminated];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_transition_stamps_timestamp() {
        let mut c = conn();
        let now = Utc::now();
        c.transition(Active, now).unwrap();
        assert!(c.terminated_at.is_none());
        c.transition(Closed, now).unwrap();
        assert_eq!(c.terminated_at, Some(now));
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let mut c = conn();
        let err = c.transition(Disconnected, Utc::now()).unwrap_err();
        assert_eq!(err.from, Establishing);
        assert_eq!(c.status, Establishing);
        assert!(c.terminated_at.is_none());
    }

    #[test]
    fn failed_cannot_recover() {
        let mut c = conn();
        c.transition(Failed, Utc::now()).unwrap();
        assert!(c.transition(Active, Utc::now()).is_err());
        assert!(c.transition(Terminated, Utc::now()).is_ok());
    }
}
