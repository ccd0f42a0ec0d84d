//! Least-loaded request dispatch.
//!
//! Every request pops the backend with the fewest in-flight requests from the
//! pool, so a backend is out of the pool for as long as it is serving. A
//! single drain task receives finished backends from the completion channel,
//! decrements their load and pushes them back.

use crate::backend::backend::{Backend, CompletionSender};
use crate::backend::pool::Pool;
use crate::config::ProxyConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{ProxyBody, error_response};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Errors produced while building or using a [`LoadBalancer`].
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("invalid backend address '{address}': {source}")]
    InvalidUrl {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme '{scheme}' in backend address '{address}', expected http")]
    UnsupportedScheme { address: String, scheme: String },

    #[error("backend address '{address}' has no host")]
    MissingHost { address: String },

    #[error("at least one backend address is required")]
    NoBackends,

    #[error("load balancer must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("no backend became available within {0:?}")]
    Exhausted(Duration),
}

/// Parse and check one upstream address.
pub fn parse_upstream(address: &str) -> Result<Url, BalancerError> {
    let url = Url::parse(address).map_err(|source| BalancerError::InvalidUrl {
        address: address.to_string(),
        source,
    })?;

    if url.scheme() != "http" {
        return Err(BalancerError::UnsupportedScheme {
            address: address.to_string(),
            scheme: url.scheme().to_string(),
        });
    }

    if url.host().is_none() {
        return Err(BalancerError::MissingHost {
            address: address.to_string(),
        });
    }

    Ok(url)
}

/// State shared between request paths and the drain task.
struct Shared {
    pool: Mutex<Pool<Arc<Backend>>>,
    /// Woken whenever a backend re-enters the pool.
    available: Notify,
    metrics: MetricsCollector,
}

impl Shared {
    fn request_finished(&self, backend: Arc<Backend>) {
        backend.load().decrement();
        self.metrics
            .set_backend_load(backend.target().as_str(), backend.load().value());

        debug!(
            backend = %backend.target(),
            load = backend.load().value(),
            "backend returned to pool"
        );

        self.pool.lock().push(backend);
        self.available.notify_one();
    }
}

/// Routes each request to the least loaded backend.
pub struct LoadBalancer {
    shared: Arc<Shared>,
    done: CompletionSender,
    backends: Vec<Arc<Backend>>,
    queue_timeout: Duration,
    drain: JoinHandle<()>,
}

impl LoadBalancer {
    /// Create a balancer over `addresses` with default settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<I, S>(addresses: I) -> Result<Self, BalancerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_config(addresses, &ProxyConfig::default(), MetricsCollector::new())
    }

    /// Create a balancer over `addresses`.
    ///
    /// Construction is all-or-nothing: the first malformed address aborts it
    /// and nothing is started. Must be called from within a Tokio runtime.
    pub fn with_config<I, S>(
        addresses: I,
        config: &ProxyConfig,
        metrics: MetricsCollector,
    ) -> Result<Self, BalancerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let backends = addresses
            .into_iter()
            .map(|address| {
                parse_upstream(address.as_ref()).map(|url| Arc::new(Backend::new(url, config)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if backends.is_empty() {
            return Err(BalancerError::NoBackends);
        }

        let runtime = Handle::try_current().map_err(|_| BalancerError::NoRuntime)?;

        let mut pool = Pool::with_capacity(backends.len());
        for backend in &backends {
            metrics.set_backend_load(backend.target().as_str(), 0);
            pool.push(Arc::clone(backend));
        }

        let (done, finished) = mpsc::channel(backends.len());
        let shared = Arc::new(Shared {
            pool: Mutex::new(pool),
            available: Notify::new(),
            metrics,
        });
        let drain = runtime.spawn(drain_completions(Arc::clone(&shared), finished));

        info!(
            backends = backends.len(),
            queue_timeout_ms = config.queue_timeout.as_millis(),
            "load balancer ready"
        );

        Ok(Self {
            shared,
            done,
            backends,
            queue_timeout: config.queue_timeout,
            drain,
        })
    }

    /// All backends, in the order they were configured.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Number of backends currently idle in the pool.
    pub fn available(&self) -> usize {
        self.shared.pool.lock().len()
    }

    /// The backend that would be selected next, if any is idle.
    pub fn least_loaded(&self) -> Option<Arc<Backend>> {
        self.shared.pool.lock().peek().cloned()
    }

    /// Take the least loaded backend out of the pool and count one request
    /// against it.
    ///
    /// Waits for a backend to be returned when all of them are busy, up to
    /// the configured queue timeout. The caller must eventually hand the
    /// backend to [`Backend::handle`] with this balancer's completion channel
    /// so it is returned.
    pub async fn acquire(&self) -> Result<Arc<Backend>, BalancerError> {
        let wait = async {
            loop {
                let notified = self.shared.available.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let popped = self.shared.pool.lock().pop();
                if let Some(backend) = popped {
                    return backend;
                }

                notified.await;
            }
        };

        let backend = tokio::time::timeout(self.queue_timeout, wait)
            .await
            .map_err(|_| BalancerError::Exhausted(self.queue_timeout))?;

        backend.load().increment();
        self.shared
            .metrics
            .set_backend_load(backend.target().as_str(), backend.load().value());

        Ok(backend)
    }

    /// Route one request and return the response for the client.
    ///
    /// Returns as soon as the upstream response head is available; the body
    /// streams afterwards and the backend goes back into the pool once it has
    /// been delivered.
    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let method = req.method().clone();

        let backend = match self.acquire().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "no backend available");
                self.shared.metrics.record_queue_timeout();
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "No backend available");
            }
        };

        debug!(
            backend = %backend.target(),
            load = backend.load().value(),
            "selected backend"
        );

        let response = Arc::clone(&backend).handle(req, self.done.clone()).await;

        self.shared.metrics.record_request(
            backend.target().as_str(),
            method.as_str(),
            response.status().as_u16(),
            start.elapsed(),
        );

        response
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("backends", &self.backends.len())
            .field("available", &self.available())
            .field("queue_timeout", &self.queue_timeout)
            .finish()
    }
}

/// Return finished backends to the pool until the channel closes.
async fn drain_completions(shared: Arc<Shared>, mut finished: mpsc::Receiver<Arc<Backend>>) {
    while let Some(backend) = finished.recv().await {
        shared.request_finished(backend);
    }
    debug!("completion channel closed");
}
