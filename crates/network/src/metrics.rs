use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Mesh metrics tracker
#[derive(Debug)]
pub struct MeshMetrics {
    // Connection lifecycle
    connections_requested: AtomicU64,
    connections_activated: AtomicU64,
    connections_failed: AtomicU64,
    connections_terminated: AtomicU64,
    connections_reaped: AtomicU64,

    // Routing
    routes_primary: AtomicU64,
    routes_fallback: AtomicU64,
    routing_failures: AtomicU64,

    // Liveness
    heartbeats_sent: AtomicU64,
    heartbeat_failures: AtomicU64,

    // Abuse
    abuse_reports: AtomicU64,
    severe_abuse_reports: AtomicU64,

    start_time: Instant,

    // Route resolution latency
    avg_route_latency_ms: RwLock<f64>,
    max_route_latency_ms: AtomicU64,
    route_latency_samples: AtomicU64,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self {
            connections_requested: AtomicU64::new(0),
            connections_activated: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            connections_terminated: AtomicU64::new(0),
            connections_reaped: AtomicU64::new(0),
            routes_primary: AtomicU64::new(0),
            routes_fallback: AtomicU64::new(0),
            routing_failures: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
            abuse_reports: AtomicU64::new(0),
            severe_abuse_reports: AtomicU64::new(0),
            start_time: Instant::now(),
            avg_route_latency_ms: RwLock::new(0.0),
            max_route_latency_ms: AtomicU64::new(0),
            route_latency_samples: AtomicU64::new(0),
        }
    }

    pub fn record_connection_requested(&self) {
        self.connections_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_activated(&self) {
        self.connections_activated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_terminated(&self) {
        self.connections_terminated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection removed by the stale sweep
    pub fn record_connection_reaped(&self) {
        self.connections_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolved route and which tier produced it
    pub fn record_route(&self, from_fallback: bool, elapsed: Duration) {
        if from_fallback {
            self.routes_fallback.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routes_primary.fetch_add(1, Ordering::Relaxed);
        }
        self.record_route_latency(elapsed);
    }

    pub fn record_routing_failure(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self, success: bool) {
        if success {
            self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_abuse_report(&self, severe: bool) {
        self.abuse_reports.fetch_add(1, Ordering::Relaxed);
        if severe {
            self.severe_abuse_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_route_latency(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;

        let mut current_max = self.max_route_latency_ms.load(Ordering::Relaxed);
        while latency_ms > current_max {
            match self.max_route_latency_ms.compare_exchange_weak(
                current_max,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }

        // exponential moving average, first sample seeds it
        let mut avg = self.avg_route_latency_ms.write();
        let samples = self.route_latency_samples.fetch_add(1, Ordering::Relaxed) + 1;
        if samples == 1 {
            *avg = latency_ms as f64;
        } else {
            let alpha = 0.1;
            *avg = *avg * (1.0 - alpha) + (latency_ms as f64) * alpha;
        }
    }

    /// Get current mesh metrics snapshot
    pub fn snapshot(&self) -> MeshMetricsSnapshot {
        MeshMetricsSnapshot {
            connections_requested: self.connections_requested.load(Ordering::Relaxed),
            connections_activated: self.connections_activated.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_terminated: self.connections_terminated.load(Ordering::Relaxed),
            connections_reaped: self.connections_reaped.load(Ordering::Relaxed),
            routes_primary: self.routes_primary.load(Ordering::Relaxed),
            routes_fallback: self.routes_fallback.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            abuse_reports: self.abuse_reports.load(Ordering::Relaxed),
            severe_abuse_reports: self.severe_abuse_reports.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            avg_route_latency_ms: *self.avg_route_latency_ms.read(),
            max_route_latency_ms: self.max_route_latency_ms.load(Ordering::Relaxed),
            route_latency_samples: self.route_latency_samples.load(Ordering::Relaxed),
        }
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of mesh metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMetricsSnapshot {
    pub connections_requested: u64,
    pub connections_activated: u64,
    pub connections_failed: u64,
    pub connections_terminated: u64,
    pub connections_reaped: u64,
    pub routes_primary: u64,
    pub routes_fallback: u64,
    pub routing_failures: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub abuse_reports: u64,
    pub severe_abuse_reports: u64,
    pub uptime_seconds: u64,
    pub avg_route_latency_ms: f64,
    pub max_route_latency_ms: u64,
    pub route_latency_samples: u64,
}

impl MeshMetricsSnapshot {
    /// Share of resolved routes that came from the local fallback
    pub fn fallback_ratio(&self) -> f64 {
        let total = self.routes_primary + self.routes_fallback;
        if total == 0 {
            return 0.0;
        }
        self.routes_fallback as f64 / total as f64
    }

    /// Share of requested connections that reached `active`
    pub fn activation_rate(&self) -> f64 {
        if self.connections_requested == 0 {
            return 1.0;
        }
        self.connections_activated as f64 / self.connections_requested as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = MeshMetrics::new();

        metrics.record_connection_requested();
        metrics.record_connection_requested();
        metrics.record_connection_activated();
        metrics.record_connection_terminated();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_requested, 2);
        assert_eq!(snapshot.connections_activated, 1);
        assert_eq!(snapshot.connections_terminated, 1);
        assert!((snapshot.activation_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_route_latency_tracking() {
        let metrics = MeshMetrics::new();

        metrics.record_route(false, Duration::from_millis(10));
        metrics.record_route(true, Duration::from_millis(30));
        metrics.record_route(true, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert!(snapshot.avg_route_latency_ms > 0.0);
        assert_eq!(snapshot.max_route_latency_ms, 30);
        assert_eq!(snapshot.route_latency_samples, 3);
        assert_eq!(snapshot.routes_primary, 1);
        assert_eq!(snapshot.routes_fallback, 2);
    }

    #[test]
    fn test_snapshot_ratios() {
        let metrics = MeshMetrics::new();
        assert_eq!(metrics.snapshot().fallback_ratio(), 0.0);

        metrics.record_route(true, Duration::from_millis(1));
        metrics.record_abuse_report(true);
        metrics.record_abuse_report(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fallback_ratio(), 1.0);
        assert_eq!(snapshot.abuse_reports, 2);
        assert_eq!(snapshot.severe_abuse_reports, 1);
    }
}
