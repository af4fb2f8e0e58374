use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use meshnet_network::{
    MeshMetricsSnapshot, MeshService, MemoryTransport, PeerTransport, WebRtcTransport,
};
use meshnet_storage::{MemoryStorage, MeshStore, SledStorage};
use meshnet_types::{AbuseType, NodeType};
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod version;

use config::{NodeConfig, StorageBackend, TransportBackend};
use version::{git_commit_hash, MESHNET_VERSION};

fn cli() -> Command {
    Command::new("meshnet-node")
        .version(MESHNET_VERSION)
        .about("MeshNet peer mesh node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path (TOML)"),
        )
        .arg(
            Arg::new("identity")
                .short('i')
                .long("identity")
                .value_name("IDENTITY")
                .help("Owner identity this node registers under"),
        )
        .arg(
            Arg::new("node-type")
                .long("node-type")
                .value_name("TYPE")
                .value_parser(value_parser!(NodeType))
                .help("Node type (peer, relay, edge, super_node)"),
        )
        .arg(
            Arg::new("address")
                .long("address")
                .value_name("HOST:PORT")
                .help("Address advertised to other nodes"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Data directory"),
        )
        .arg(
            Arg::new("memory-storage")
                .long("memory-storage")
                .action(ArgAction::SetTrue)
                .help("Keep mesh state in memory only"),
        )
        .arg(
            Arg::new("loopback-transport")
                .long("loopback-transport")
                .action(ArgAction::SetTrue)
                .help("Use in-process sessions instead of WebRTC"),
        )
        .arg(
            Arg::new("ai-service-url")
                .long("ai-service-url")
                .value_name("URL")
                .help("Base URL of the AI routing service"),
        )
        .arg(
            Arg::new("max-connections")
                .long("max-connections")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Maximum concurrent peer connections"),
        )
        .arg(
            Arg::new("connect")
                .long("connect")
                .value_name("IDENTITY")
                .action(ArgAction::Append)
                .help("Open a connection to IDENTITY after startup (repeatable)"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_names(["NODE_ID", "TYPE"])
                .num_args(2)
                .value_parser(value_parser!(String))
                .help("File an abuse report against NODE_ID after startup"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "compact"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Do not start the Prometheus exporter"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate configuration, print it and exit"),
        )
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut NodeConfig) {
    if let Some(identity) = matches.get_one::<String>("identity") {
        config.identity = identity.clone();
    }
    if let Some(node_type) = matches.get_one::<NodeType>("node-type") {
        config.node_type = *node_type;
    }
    if let Some(address) = matches.get_one::<String>("address") {
        config.address = address.clone();
    }
    if let Some(data_dir) = matches.get_one::<PathBuf>("data-dir") {
        config.data_dir = Some(data_dir.clone());
    }
    if matches.get_flag("memory-storage") {
        config.storage = StorageBackend::Memory;
    }
    if matches.get_flag("loopback-transport") {
        config.transport = TransportBackend::Loopback;
    }
    if let Some(url) = matches.get_one::<String>("ai-service-url") {
        config.ai_service_url = Some(url.clone());
    }
    if let Some(max) = matches.get_one::<usize>("max-connections") {
        config.max_connections = *max;
    }
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }
    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }
    if matches.get_flag("disable-metrics") {
        config.metrics_enabled = false;
    }
}

fn init_logging(config: &NodeConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn init_metrics(config: &NodeConfig) -> bool {
    if !config.metrics_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return false;
    }

    let addr: SocketAddr = match config.metrics_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            warn!(addr = %config.metrics_addr, error = %err, "Invalid metrics address");
            return false;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!(%addr, "Prometheus metrics exporter listening");
            describe_gauge!("meshnet_connections_live", "Connections currently in the table");
            describe_gauge!("meshnet_connections_activated", "Connections that reached active");
            describe_gauge!("meshnet_connections_failed", "Connections that failed to establish");
            describe_gauge!("meshnet_connections_reaped", "Stale connections cleaned up");
            describe_gauge!("meshnet_routes_primary", "Routes resolved by the AI service");
            describe_gauge!("meshnet_routes_fallback", "Routes resolved by local path finding");
            describe_gauge!("meshnet_routing_failures", "Route requests with no usable route");
            describe_gauge!("meshnet_heartbeat_failures", "Heartbeats that failed to publish");
            describe_gauge!("meshnet_route_latency_avg_ms", "Average route resolution latency");
            true
        }
        Err(err) => {
            warn!(error = %err, "Failed to install Prometheus metrics exporter");
            false
        }
    }
}

fn publish_gauges(snapshot: &MeshMetricsSnapshot, live: usize) {
    gauge!("meshnet_connections_live").set(live as f64);
    gauge!("meshnet_connections_activated").set(snapshot.connections_activated as f64);
    gauge!("meshnet_connections_failed").set(snapshot.connections_failed as f64);
    gauge!("meshnet_connections_reaped").set(snapshot.connections_reaped as f64);
    gauge!("meshnet_routes_primary").set(snapshot.routes_primary as f64);
    gauge!("meshnet_routes_fallback").set(snapshot.routes_fallback as f64);
    gauge!("meshnet_routing_failures").set(snapshot.routing_failures as f64);
    gauge!("meshnet_heartbeat_failures").set(snapshot.heartbeat_failures as f64);
    gauge!("meshnet_route_latency_avg_ms").set(snapshot.avg_route_latency_ms);
}

fn load_config(matches: &clap::ArgMatches) -> Result<NodeConfig> {
    let path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let mut config = NodeConfig::load(path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    if matches.get_flag("check") {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config);
    info!(
        version = MESHNET_VERSION,
        commit = git_commit_hash(),
        identity = %config.identity,
        node_type = %config.node_type,
        "Starting MeshNet node"
    );
    let metrics_enabled = init_metrics(&config);

    let mut sled = None;
    let store: Arc<dyn MeshStore> = match config.storage {
        StorageBackend::Sled => {
            let db_path = config.resolved_data_dir().join("db");
            std::fs::create_dir_all(&db_path)
                .with_context(|| format!("failed to create {}", db_path.display()))?;
            let storage = Arc::new(
                SledStorage::with_policy(&db_path, config.reputation_policy())
                    .with_context(|| format!("failed to open store at {}", db_path.display()))?,
            );
            info!(path = %db_path.display(), "Opened sled store");
            sled = Some(storage.clone());
            storage
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; mesh state is lost on exit");
            Arc::new(MemoryStorage::with_policy(config.reputation_policy()))
        }
    };

    let transport: Arc<dyn PeerTransport> = match config.transport {
        TransportBackend::WebRtc => {
            info!(
                stun = config.stun_servers.len(),
                turn = config.turn_url.is_some(),
                "Using WebRTC transport"
            );
            Arc::new(WebRtcTransport::new().context("failed to initialise WebRTC transport")?)
        }
        TransportBackend::Loopback => {
            warn!("Using in-process loopback transport; sessions never leave this node");
            Arc::new(MemoryTransport::new())
        }
    };

    let service = Arc::new(MeshService::start(config.mesh_config(), store, transport)?);
    let node = service.node_info()?;
    info!(
        node_id = %node.node_id,
        address = %node.address,
        max_connections = node.max_connections,
        "MeshNet node is ready"
    );

    if let Some(mut values) = matches.get_many::<String>("report") {
        if let (Some(node_id), Some(kind)) = (values.next(), values.next()) {
            let filed = kind
                .parse::<AbuseType>()
                .map_err(anyhow::Error::from)
                .and_then(|abuse_type| {
                    Ok(service.report_abuse(node_id, abuse_type, "reported via cli")?)
                });
            match filed {
                Ok(report) => info!(report_id = %report.report_id, "Abuse report filed"),
                Err(e) => error!(node_id = %node_id, error = %e, "Abuse report failed"),
            }
        }
    }

    if let Some(targets) = matches.get_many::<String>("connect") {
        for target in targets {
            match service.connect(target, false).await {
                Ok(conn) => info!(
                    connection_id = %conn.connection_id,
                    target = %target,
                    "Connection requested"
                ),
                Err(e) => error!(
                    target = %target,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Connection failed"
                ),
            }
        }
    }

    let publisher = metrics_enabled.then(|| {
        let service = service.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let live = service.connections().connection_count();
                publish_gauges(&service.metrics(), live);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down MeshNet node");

    if let Some(publisher) = publisher {
        publisher.abort();
    }
    if let Err(e) = service.shutdown().await {
        error!(error = %e, "Failed to mark node offline");
    }
    if let Some(sled) = sled {
        sled.flush()?;
    }

    info!("MeshNet node shutdown complete");
    Ok(())
}
