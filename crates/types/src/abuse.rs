use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::node::NodeId;

/// Category of an abuse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseType {
    Spam,
    Harassment,
    InappropriateContent,
    MaliciousNode,
    SecurityThreat,
    Other,
}

impl AbuseType {
    /// Severe types trigger an immediate reputation penalty.
    pub fn is_severe(&self) -> bool {
        matches!(self, AbuseType::MaliciousNode | AbuseType::SecurityThreat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseType::Spam => "spam",
            AbuseType::Harassment => "harassment",
            AbuseType::InappropriateContent => "inappropriate_content",
            AbuseType::MaliciousNode => "malicious_node",
            AbuseType::SecurityThreat => "security_threat",
            AbuseType::Other => "other",
        }
    }
}

impl fmt::Display for AbuseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown abuse type: {0}")]
pub struct UnknownAbuseType(pub String);

impl FromStr for AbuseType {
    type Err = UnknownAbuseType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "spam" => Ok(AbuseType::Spam),
            "harassment" => Ok(AbuseType::Harassment),
            "inappropriate_content" => Ok(AbuseType::InappropriateContent),
            "malicious_node" => Ok(AbuseType::MaliciousNode),
            "security_threat" => Ok(AbuseType::SecurityThreat),
            "other" => Ok(AbuseType::Other),
            other => Err(UnknownAbuseType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Reviewed,
}

/// Abuse signal filed against a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseReport {
    pub report_id: String,
    pub reporter_identity: String,
    pub reported_node_id: NodeId,
    pub abuse_type: AbuseType,
    pub description: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

impl AbuseReport {
    pub fn pending(
        report_id: impl Into<String>,
        reporter_identity: impl Into<String>,
        reported_node_id: impl Into<NodeId>,
        abuse_type: AbuseType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            report_id: report_id.into(),
            reporter_identity: reporter_identity.into(),
            reported_node_id: reported_node_id.into(),
            abuse_type,
            description: description.into(),
            status: ReportStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_malicious_and_security_are_severe() {
        assert!(AbuseType::MaliciousNode.is_severe());
        assert!(AbuseType::SecurityThreat.is_severe());
        assert!(!AbuseType::Spam.is_severe());
        assert!(!AbuseType::Other.is_severe());
    }

    #[test]
    fn parses_kebab_and_snake_case() {
        assert_eq!(
            "security-threat".parse::<AbuseType>().unwrap(),
            AbuseType::SecurityThreat
        );
        assert_eq!(
            "malicious_node".parse::<AbuseType>().unwrap(),
            AbuseType::MaliciousNode
        );
    }
}
