//! Metrics collector using prometheus-client.
//!
//! Provides metrics for request counts, latency, per-backend load and
//! client connections.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub backend: String,
    pub method: String,
    pub status: String,
}

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total requests counter.
    requests_total: Family<RequestLabels, Counter>,
    /// Time until the upstream response head is available (in seconds).
    request_duration_seconds: Family<BackendLabels, Histogram>,
    /// In-flight requests per backend.
    backend_load: Family<BackendLabels, Gauge>,
    /// Open client connections.
    active_connections: Gauge,
    /// Total client connections accepted.
    connections_total: Counter,
    /// Requests rejected because no backend became free in time.
    queue_timeouts_total: Counter,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );
        let backend_load = Family::<BackendLabels, Gauge>::default();
        let active_connections = Gauge::default();
        let connections_total = Counter::default();
        let queue_timeouts_total = Counter::default();

        registry.register(
            "leastlb_requests",
            "Total number of requests forwarded",
            requests_total.clone(),
        );
        registry.register(
            "leastlb_request_duration_seconds",
            "Time until the upstream response head is available",
            request_duration_seconds.clone(),
        );
        registry.register(
            "leastlb_backend_load",
            "Requests currently in flight per backend",
            backend_load.clone(),
        );
        registry.register(
            "leastlb_active_connections",
            "Number of open client connections",
            active_connections.clone(),
        );
        registry.register(
            "leastlb_connections",
            "Total number of client connections",
            connections_total.clone(),
        );
        registry.register(
            "leastlb_queue_timeouts",
            "Requests rejected because every backend stayed busy",
            queue_timeouts_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                backend_load,
                active_connections,
                connections_total,
                queue_timeouts_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a forwarded request.
    pub fn record_request(&self, backend: &str, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            backend: backend.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();

        let backend_labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .request_duration_seconds
            .get_or_create(&backend_labels)
            .observe(duration.as_secs_f64());
    }

    /// Publish the current in-flight count of a backend.
    pub fn set_backend_load(&self, backend: &str, load: u64) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_load
            .get_or_create(&labels)
            .set(i64::try_from(load).unwrap_or(i64::MAX));
    }

    /// Record a request that gave up waiting for a free backend.
    pub fn record_queue_timeout(&self) {
        self.inner.queue_timeouts_total.inc();
    }

    /// Increment active connections.
    pub fn connection_opened(&self) {
        self.inner.active_connections.inc();
        self.inner.connections_total.inc();
    }

    /// Decrement active connections.
    pub fn connection_closed(&self) {
        self.inner.active_connections.dec();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
