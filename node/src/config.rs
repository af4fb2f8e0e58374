//! Node configuration: defaults, then an optional TOML file, then
//! `MESHNET_*` environment variables, then command line overrides.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use meshnet_network::{
    ConnectionConfig, HealthCheckConfig, IceServer, MeshConfig, NodeDefaults, ReputationConfig,
    RoutingConfig, TransportConfig, CONTROL_CHANNEL_LABEL,
};
use meshnet_types::{
    GeoLocation, MediaType, NodeCapabilities, NodeType, ReputationPolicy, TrustThresholds,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportBackend {
    #[serde(rename = "webrtc")]
    WebRtc,
    /// In-process sessions that never leave this node
    #[serde(rename = "loopback")]
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // Identity
    pub identity: String,
    pub node_type: NodeType,
    pub address: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,

    // Capacity and capabilities
    pub max_connections: usize,
    pub bandwidth_capacity_mbps: u32,
    pub can_relay: bool,
    pub supports_ai_compression: bool,
    pub supports_transcoding: bool,
    pub supports_recording: bool,

    // Storage
    pub storage: StorageBackend,
    pub data_dir: Option<PathBuf>,

    // Routing
    pub ai_service_url: Option<String>,
    pub routing_timeout_ms: u64,
    pub route_ttl_secs: u64,
    pub media_type: MediaType,

    // Transport
    pub transport: TransportBackend,
    pub stun_servers: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,

    // Health
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_threshold_secs: u64,

    // Reputation
    pub malicious_node_penalty: i32,
    pub security_threat_penalty: i32,
    pub trusted_min_score: i32,
    pub verified_min_score: i32,
    pub suspicious_below_score: i32,
    pub banned_below_score: i32,

    // Observability
    pub metrics_enabled: bool,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let reputation = ReputationConfig::default();
        let thresholds = TrustThresholds::default();
        Self {
            identity: String::new(),
            node_type: NodeType::Peer,
            address: "0.0.0.0:7400".to_string(),
            region: "unknown".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            max_connections: 50,
            bandwidth_capacity_mbps: 100,
            can_relay: false,
            supports_ai_compression: false,
            supports_transcoding: false,
            supports_recording: false,
            storage: StorageBackend::Sled,
            data_dir: None,
            ai_service_url: None,
            routing_timeout_ms: 5_000,
            route_ttl_secs: 3_600,
            media_type: MediaType::Video,
            transport: TransportBackend::WebRtc,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 60,
            stale_threshold_secs: 300,
            malicious_node_penalty: reputation.malicious_node_penalty,
            security_threat_penalty: reputation.security_threat_penalty,
            trusted_min_score: thresholds.trusted_min,
            verified_min_score: thresholds.verified_min,
            suspicious_below_score: thresholds.suspicious_below,
            banned_below_score: thresholds.banned_below,
            metrics_enabled: true,
            metrics_addr: "127.0.0.1:9464".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl NodeConfig {
    /// Layer the config file (if any) and `MESHNET_*` environment over the
    /// defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("MESHNET")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("stun_servers"),
        );

        let config = builder
            .build()
            .context("failed to read node configuration")?
            .try_deserialize::<NodeConfig>()
            .context("invalid node configuration")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            bail!("identity must be set (--identity or MESHNET_IDENTITY)");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.routing_timeout_ms == 0 {
            bail!("routing_timeout_ms must be positive");
        }
        for (key, value) in [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stale_threshold_secs", self.stale_threshold_secs),
        ] {
            if value == 0 {
                bail!("{key} must be positive");
            }
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact") {
            bail!("log_format must be `pretty` or `compact`, got `{}`", self.log_format);
        }
        if self.turn_url.is_some()
            && (self.turn_username.is_none() || self.turn_credential.is_none())
        {
            bail!("turn_url requires turn_username and turn_credential");
        }
        if self.malicious_node_penalty > 0 || self.security_threat_penalty > 0 {
            bail!("abuse penalties must not be positive");
        }
        let policy = ReputationPolicy::default();
        let t = &self.reputation_policy().thresholds;
        if !(policy.min_score <= t.banned_below
            && t.banned_below <= t.suspicious_below
            && t.suspicious_below <= t.trusted_min
            && t.trusted_min <= t.verified_min
            && t.verified_min <= policy.max_score)
        {
            bail!(
                "trust thresholds must be ordered banned <= suspicious <= trusted <= verified \
                 within {}..={}",
                policy.min_score,
                policy.max_score
            );
        }
        Ok(())
    }

    /// Score bounds with the configured trust thresholds.
    pub fn reputation_policy(&self) -> ReputationPolicy {
        ReputationPolicy {
            thresholds: TrustThresholds {
                trusted_min: self.trusted_min_score,
                verified_min: self.verified_min_score,
                suspicious_below: self.suspicious_below_score,
                banned_below: self.banned_below_score,
            },
            ..ReputationPolicy::default()
        }
    }

    /// Storage directory, defaulting to the platform data dir.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("meshnet")
        })
    }

    pub fn transport(&self) -> TransportConfig {
        let stun_servers = self.stun_servers.iter().map(IceServer::stun).collect();
        let turn_servers = match (&self.turn_url, &self.turn_username, &self.turn_credential) {
            (Some(url), Some(username), Some(credential)) => {
                vec![IceServer::turn(url, username, credential)]
            }
            _ => Vec::new(),
        };
        TransportConfig {
            stun_servers,
            turn_servers,
        }
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            identity: self.identity.clone(),
            node_type: self.node_type,
            node: NodeDefaults {
                address: self.address.clone(),
                max_connections: u32::try_from(self.max_connections).unwrap_or(u32::MAX),
                bandwidth_capacity_mbps: self.bandwidth_capacity_mbps,
                location: GeoLocation {
                    region: self.region.clone(),
                    latitude: self.latitude,
                    longitude: self.longitude,
                },
                capabilities: NodeCapabilities {
                    can_relay: self.can_relay,
                    supports_ai_compression: self.supports_ai_compression,
                    supports_transcoding: self.supports_transcoding,
                    supports_recording: self.supports_recording,
                },
                ..NodeDefaults::default()
            },
            routing: RoutingConfig {
                ai_service_url: self.ai_service_url.clone(),
                request_timeout: Duration::from_millis(self.routing_timeout_ms),
                route_ttl: Duration::from_secs(self.route_ttl_secs),
                media_type: self.media_type,
            },
            connection: ConnectionConfig {
                max_connections: self.max_connections,
                transport: self.transport(),
                control_channel_label: CONTROL_CHANNEL_LABEL.to_string(),
            },
            health: HealthCheckConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            },
            reputation: ReputationConfig {
                malicious_node_penalty: self.malicious_node_penalty,
                security_threat_penalty: self.security_threat_penalty,
                ..ReputationConfig::default()
            },
        }
    }
}
