//! Route resolution
//!
//! Routes come from two tiers. The primary tier asks the AI routing service
//! over HTTP with a short timeout; any failure there (timeout, transport
//! error, non-success status, malformed path) hands the request to the
//! fallback tier, which resolves both identities to online nodes in the
//! store and runs the store's path finding.

use async_trait::async_trait;
use meshnet_storage::MeshStore;
use meshnet_types::{generate_id, validate_path, MediaType, MeshRoute, NodeId, RouteOrigin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::RoutingError;
use crate::metrics::MeshMetrics;

/// Routing configuration
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Base URL of the AI routing service; `None` disables the primary tier.
    /// `find-route` is appended below the full path.
    pub ai_service_url: Option<String>,
    pub request_timeout: Duration,
    pub route_ttl: Duration,
    pub media_type: MediaType,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ai_service_url: None,
            request_timeout: Duration::from_secs(5),
            route_ttl: Duration::from_secs(3600),
            media_type: MediaType::Video,
        }
    }
}

/// What the caller wants routed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRequest {
    pub source_identity: String,
    /// Pins the path's first node when the caller already knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<NodeId>,
    pub destination_identity: String,
    pub media_type: MediaType,
    pub require_advanced_feature: bool,
}

/// One tier of route resolution
#[async_trait]
pub trait RouteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find_route(&self, request: &RouteRequest) -> Result<MeshRoute, RoutingError>;
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[derive(Debug, Clone, Deserialize)]
struct RouteCandidate {
    path: Vec<NodeId>,
    score: f64,
    #[serde(default)]
    predicted_latency_ms: u32,
    #[serde(default)]
    predicted_bandwidth_mbps: u32,
    #[serde(default)]
    route_id: Option<String>,
    #[serde(default)]
    degraded: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct FindRouteResponse {
    #[serde(flatten)]
    best: RouteCandidate,
    #[serde(default)]
    alternatives: Vec<RouteCandidate>,
}

/// HTTP client for the AI routing service
pub struct AiRoutingClient {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    route_ttl: Duration,
}

impl AiRoutingClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        route_ttl: Duration,
    ) -> Result<Self, RoutingError> {
        let mut base = Url::parse(base_url)?;
        // join() replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("find-route")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoutingError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            timeout,
            route_ttl,
        })
    }

    pub fn from_config(config: &RoutingConfig) -> Result<Option<Self>, RoutingError> {
        config
            .ai_service_url
            .as_deref()
            .map(|url| Self::new(url, config.request_timeout, config.route_ttl))
            .transpose()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call(&self, request: &RouteRequest) -> Result<FindRouteResponse, RoutingError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RoutingError::Status { status, body });
        }

        response
            .json::<FindRouteResponse>()
            .await
            .map_err(|e| RoutingError::Malformed(e.to_string()))
    }

    fn into_route(
        &self,
        request: &RouteRequest,
        candidate: RouteCandidate,
    ) -> Result<MeshRoute, RoutingError> {
        if !candidate.score.is_finite() {
            return Err(RoutingError::Malformed("non-finite score".into()));
        }
        let route_id = candidate.route_id.unwrap_or_else(generate_id);
        let mut route = MeshRoute::from_path(
            route_id,
            candidate.path,
            candidate.score,
            candidate.predicted_latency_ms,
            candidate.predicted_bandwidth_mbps,
            RouteOrigin::AiService,
            chrono_ttl(self.route_ttl),
        )
        .map_err(|e| RoutingError::Malformed(e.to_string()))?;
        if let Some(source) = &request.source_node_id {
            route
                .ensure_source(source)
                .map_err(|e| RoutingError::Malformed(e.to_string()))?;
        }
        route.degraded = candidate.degraded;
        Ok(route)
    }
}

#[async_trait]
impl RouteProvider for AiRoutingClient {
    fn name(&self) -> &'static str {
        "ai-service"
    }

    async fn find_route(&self, request: &RouteRequest) -> Result<MeshRoute, RoutingError> {
        let response = tokio::time::timeout(self.timeout, self.call(request)).await??;

        let mut routes = Vec::new();
        for candidate in std::iter::once(response.best).chain(response.alternatives) {
            match self.into_route(request, candidate) {
                Ok(route) => routes.push(route),
                Err(e) => debug!(error = %e, "Discarding malformed route candidate"),
            }
        }
        routes.sort_by(|a, b| a.preference_cmp(b));
        routes
            .into_iter()
            .next()
            .ok_or_else(|| RoutingError::Malformed("no valid path in response".into()))
    }
}

/// Fallback tier backed by the store's path finding
pub struct StoreRouteProvider {
    store: Arc<dyn MeshStore>,
    route_ttl: Duration,
}

impl StoreRouteProvider {
    pub fn new(store: Arc<dyn MeshStore>, route_ttl: Duration) -> Self {
        Self { store, route_ttl }
    }

    fn resolve_identity(&self, identity: &str) -> Result<NodeId, RoutingError> {
        self.store
            .find_online_node_by_identity(identity)
            .map_err(|e| RoutingError::Store(format!("{e:#}")))?
            .map(|node| node.node_id)
            .ok_or_else(|| RoutingError::UnknownIdentity {
                identity: identity.to_string(),
            })
    }

    /// A route is degraded when no node past the source advertises the
    /// advanced capability.
    fn lacks_advanced_support(&self, path: &[NodeId]) -> Result<bool, RoutingError> {
        for node_id in path.iter().skip(1) {
            let node = self
                .store
                .get_node(node_id)
                .map_err(|e| RoutingError::Store(format!("{e:#}")))?;
            if node.is_some_and(|n| n.capabilities.supports_ai_compression) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl RouteProvider for StoreRouteProvider {
    fn name(&self) -> &'static str {
        "store-fallback"
    }

    async fn find_route(&self, request: &RouteRequest) -> Result<MeshRoute, RoutingError> {
        let source = match &request.source_node_id {
            Some(node_id) => node_id.clone(),
            None => self.resolve_identity(&request.source_identity)?,
        };
        let destination = self.resolve_identity(&request.destination_identity)?;

        let record = self
            .store
            .find_best_path(&source, &destination)
            .map_err(|e| RoutingError::Store(format!("{e:#}")))?
            .ok_or_else(|| RoutingError::NoPath {
                source_identity: request.source_identity.clone(),
                destination_identity: request.destination_identity.clone(),
            })?;
        validate_path(&record.path).map_err(|e| RoutingError::Malformed(e.to_string()))?;

        let degraded =
            request.require_advanced_feature && self.lacks_advanced_support(&record.path)?;
        // fewer hops score higher; the AI tier owns real scoring
        let score = 1.0 / record.hop_count().max(1) as f64;
        let mut route = MeshRoute::from_path(
            generate_id(),
            record.path,
            score,
            record.total_latency_ms,
            record.min_bandwidth_mbps,
            RouteOrigin::LocalFallback,
            chrono_ttl(self.route_ttl),
        )
        .map_err(|e| RoutingError::Malformed(e.to_string()))?;
        route.degraded = degraded;
        Ok(route)
    }
}

/// Two-tier resolver
pub struct RouteResolver {
    primary: Option<Arc<dyn RouteProvider>>,
    fallback: Arc<dyn RouteProvider>,
    store: Arc<dyn MeshStore>,
    metrics: Arc<MeshMetrics>,
    media_type: MediaType,
}

impl RouteResolver {
    pub fn new(
        primary: Option<Arc<dyn RouteProvider>>,
        fallback: Arc<dyn RouteProvider>,
        store: Arc<dyn MeshStore>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            primary,
            fallback,
            store,
            metrics,
            media_type: MediaType::default(),
        }
    }

    /// Resolver with the AI client (when configured) and the store fallback
    pub fn from_config(
        config: &RoutingConfig,
        store: Arc<dyn MeshStore>,
        metrics: Arc<MeshMetrics>,
    ) -> Result<Self, RoutingError> {
        let primary = AiRoutingClient::from_config(config)?
            .map(|client| Arc::new(client) as Arc<dyn RouteProvider>);
        let fallback = Arc::new(StoreRouteProvider::new(store.clone(), config.route_ttl));
        Ok(Self::new(primary, fallback, store, metrics).with_media_type(config.media_type))
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// The last node of a primary route must be owned by the identity the
    /// caller asked for.
    fn check_destination(
        &self,
        route: MeshRoute,
        destination_identity: &str,
    ) -> Result<MeshRoute, RoutingError> {
        let owner = self
            .store
            .get_node(&route.destination_node_id)
            .map_err(|e| RoutingError::Store(format!("{e:#}")))?
            .map(|node| node.owner_identity);
        match owner {
            Some(owner) if owner == destination_identity => Ok(route),
            Some(owner) => Err(RoutingError::Malformed(format!(
                "route ends at {} owned by {owner}, expected {destination_identity}",
                route.destination_node_id
            ))),
            None => Err(RoutingError::Malformed(format!(
                "route ends at unknown node {}",
                route.destination_node_id
            ))),
        }
    }

    /// Resolve a route between two identities. The fallback tier runs only
    /// when the primary tier is absent or fails.
    pub async fn request_route(
        &self,
        source_identity: &str,
        destination_identity: &str,
        require_advanced_feature: bool,
    ) -> Result<MeshRoute, RoutingError> {
        self.request_route_from(
            None,
            source_identity,
            destination_identity,
            require_advanced_feature,
        )
        .await
    }

    /// Like `request_route`, with the first hop pinned to `source_node_id`.
    pub async fn request_route_from(
        &self,
        source_node_id: Option<&str>,
        source_identity: &str,
        destination_identity: &str,
        require_advanced_feature: bool,
    ) -> Result<MeshRoute, RoutingError> {
        let started = Instant::now();
        let request = RouteRequest {
            source_identity: source_identity.to_string(),
            source_node_id: source_node_id.map(str::to_string),
            destination_identity: destination_identity.to_string(),
            media_type: self.media_type,
            require_advanced_feature,
        };

        let mut from_fallback = false;
        let primary_result = match &self.primary {
            Some(primary) => match primary
                .find_route(&request)
                .await
                .and_then(|route| self.check_destination(route, destination_identity))
            {
                Ok(route) => Some(route),
                Err(e) => {
                    warn!(
                        provider = primary.name(),
                        error = %e,
                        destination = destination_identity,
                        "Primary routing failed, using fallback"
                    );
                    None
                }
            },
            None => None,
        };

        let route = match primary_result {
            Some(route) => route,
            None => {
                from_fallback = true;
                self.fallback.find_route(&request).await.map_err(|e| {
                    self.metrics.record_routing_failure();
                    e
                })?
            }
        };

        if route.degraded {
            info!(
                route_id = %route.route_id,
                "Advanced feature unavailable on route, continuing degraded"
            );
        }
        self.metrics.record_route(from_fallback, started.elapsed());

        if let Err(e) = self.store.put_route(&route) {
            warn!(route_id = %route.route_id, error = %e, "Failed to persist route");
        }

        debug!(
            route_id = %route.route_id,
            hops = route.hop_count(),
            origin = ?route.origin,
            "Route resolved"
        );
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_storage::MemoryStorage;
    use meshnet_types::{MeshLink, MeshNode, NodeType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        result: Result<Vec<NodeId>, ()>,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn ok(path: &[&str]) -> Self {
            Self {
                result: Ok(path.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RouteProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn find_route(&self, _request: &RouteRequest) -> Result<MeshRoute, RoutingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(path) => Ok(MeshRoute::from_path(
                    "fixed-route",
                    path.clone(),
                    0.9,
                    10,
                    10,
                    RouteOrigin::AiService,
                    chrono::Duration::minutes(1),
                )
                .unwrap()),
                Err(()) => Err(RoutingError::Timeout),
            }
        }
    }

    fn seeded_store() -> Arc<MemoryStorage> {
        let store = Arc::new(MemoryStorage::new());
        let mut relay = MeshNode::new("relay", "ops", "10.0.0.9:7000", NodeType::Relay, 50);
        relay.capabilities.supports_ai_compression = true;
        for node in [
            MeshNode::new("a", "alice", "10.0.0.1:7000", NodeType::Peer, 50),
            relay,
            MeshNode::new("b", "bob", "10.0.0.2:7000", NodeType::Peer, 50),
        ] {
            store.put_node(&node).unwrap();
        }
        store
            .record_link(&MeshLink::validated("a", "relay", 5, 50))
            .unwrap();
        store
            .record_link(&MeshLink::validated("relay", "b", 5, 50))
            .unwrap();
        store
    }

    fn resolver(
        primary: Option<Arc<FixedProvider>>,
        store: Arc<MemoryStorage>,
    ) -> RouteResolver {
        let fallback = Arc::new(StoreRouteProvider::new(
            store.clone(),
            Duration::from_secs(60),
        ));
        RouteResolver::new(
            primary.map(|p| p as Arc<dyn RouteProvider>),
            fallback,
            store,
            Arc::new(MeshMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_fallback_not_used_when_primary_succeeds() {
        let store = seeded_store();
        let primary = Arc::new(FixedProvider::ok(&["a", "b"]));
        let resolver = resolver(Some(primary.clone()), store.clone());

        let route = resolver.request_route("alice", "bob", false).await.unwrap();
        assert_eq!(route.origin, RouteOrigin::AiService);
        assert_eq!(route.path, vec!["a", "b"]);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_route("fixed-route").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let store = seeded_store();
        let resolver = resolver(Some(Arc::new(FixedProvider::failing())), store);

        let route = resolver.request_route("alice", "bob", false).await.unwrap();
        assert_eq!(route.origin, RouteOrigin::LocalFallback);
        assert_eq!(route.path, vec!["a", "relay", "b"]);
        assert_eq!(route.predicted_latency_ms, 10);
        assert!(!route.degraded);
    }

    #[tokio::test]
    async fn test_primary_route_to_other_owner_falls_back() {
        let store = seeded_store();
        // ends at the relay, which "ops" owns
        let primary = Arc::new(FixedProvider::ok(&["a", "relay"]));
        let resolver = resolver(Some(primary.clone()), store.clone());

        let route = resolver.request_route("alice", "bob", false).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(route.origin, RouteOrigin::LocalFallback);
        assert_eq!(route.destination_node_id, "b");
        assert!(store.get_route("fixed-route").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_primary_route_to_unknown_node_falls_back() {
        let store = seeded_store();
        let resolver = resolver(Some(Arc::new(FixedProvider::ok(&["a", "ghost"]))), store);

        let route = resolver.request_route("alice", "bob", false).await.unwrap();
        assert_eq!(route.origin, RouteOrigin::LocalFallback);
        assert_eq!(route.path, vec!["a", "relay", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_identity_has_no_route() {
        let store = seeded_store();
        let resolver = resolver(None, store);

        let err = resolver
            .request_route("alice", "nobody", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnknownIdentity { .. }));
    }

    #[tokio::test]
    async fn test_advanced_requirement_marks_degraded() {
        let store = Arc::new(MemoryStorage::new());
        store
            .put_node(&MeshNode::new("a", "alice", "x", NodeType::Peer, 50))
            .unwrap();
        store
            .put_node(&MeshNode::new("b", "bob", "y", NodeType::Peer, 50))
            .unwrap();
        let resolver = resolver(None, store);

        let route = resolver.request_route("alice", "bob", true).await.unwrap();
        assert!(route.degraded);
        assert_eq!(route.path, vec!["a", "b"]);

        let route = resolver.request_route("alice", "bob", false).await.unwrap();
        assert!(!route.degraded);
    }

    #[tokio::test]
    async fn test_advanced_capability_on_path_is_not_degraded() {
        let store = seeded_store();
        let resolver = resolver(None, store);

        let route = resolver.request_route("alice", "bob", true).await.unwrap();
        assert!(!route.degraded);
    }

    #[test]
    fn test_client_endpoint_join() {
        let client = AiRoutingClient::new(
            "http://127.0.0.1:9000/api/",
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "http://127.0.0.1:9000/api/find-route"
        );
        let client = AiRoutingClient::new(
            "http://127.0.0.1:9000/api",
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "http://127.0.0.1:9000/api/find-route"
        );
        let client = AiRoutingClient::new(
            "http://127.0.0.1:9000",
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(client.endpoint().as_str(), "http://127.0.0.1:9000/find-route");
        assert!(
            AiRoutingClient::new("not a url", Duration::from_secs(1), Duration::from_secs(1))
                .is_err()
        );
    }
}
