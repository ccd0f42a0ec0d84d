//! A single upstream server and its request handling.

use crate::backend::counter::LoadCounter;
use crate::backend::pool::{NOT_IN_POOL, PoolEntry};
use crate::config::ProxyConfig;
use crate::proxy::{ProxyBody, ReverseProxy, error_response};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::{Request, Response, StatusCode};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Channel on which finished backends are handed back to the balancer.
pub type CompletionSender = mpsc::Sender<Arc<Backend>>;

/// One upstream server.
///
/// The load counter is written by the balancer, the pool index only by the
/// pool that currently holds the backend.
#[derive(Debug)]
pub struct Backend {
    target: Url,
    proxy: ReverseProxy,
    load: LoadCounter,
    index: AtomicIsize,
}

impl Backend {
    /// Create a backend with zero load that is not in any pool.
    pub fn new(target: Url, config: &ProxyConfig) -> Self {
        Self {
            proxy: ReverseProxy::new(target.clone(), config),
            target,
            load: LoadCounter::new(),
            index: AtomicIsize::new(NOT_IN_POOL),
        }
    }

    /// Upstream base URL.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// The forwarding mechanism for this upstream.
    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    /// In-flight request counter.
    pub fn load(&self) -> &LoadCounter {
        &self.load
    }

    /// Position in the balancer's pool, or [`NOT_IN_POOL`] while serving.
    pub fn index(&self) -> isize {
        self.index.load(Ordering::Acquire)
    }

    /// Forward `req` upstream and return the response to send to the client.
    ///
    /// The backend is published on `done` exactly once: when the response
    /// body has been fully delivered or dropped, or when the returned future
    /// is dropped before completing. Forwarding failures become a 502 and are
    /// reported the same way as successes.
    pub fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
        done: CompletionSender,
    ) -> impl Future<Output = Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let completion = CompletionGuard::new(Arc::clone(&self), done);

        async move {
            let response = match self.proxy.forward(req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(backend = %self.target, error = %e, "forwarding to backend failed");
                    error_response(StatusCode::BAD_GATEWAY, "Failed to forward request to backend")
                }
            };

            response.map(|body| TrackedBody::new(body, completion).boxed())
        }
    }
}

impl PoolEntry for Backend {
    fn priority(&self) -> u64 {
        self.load.value()
    }

    fn pool_index(&self) -> isize {
        self.index()
    }

    fn set_pool_index(&self, index: isize) {
        self.index.store(index, Ordering::Release);
    }
}

/// Publishes its backend on the completion channel when dropped.
#[derive(Debug)]
struct CompletionGuard {
    backend: Option<Arc<Backend>>,
    done: CompletionSender,
}

impl CompletionGuard {
    fn new(backend: Arc<Backend>, done: CompletionSender) -> Self {
        Self {
            backend: Some(backend),
            done,
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };

        debug!(backend = %backend.target, "request finished");

        // Capacity equals the backend count and a backend is out of the pool
        // while serving, so the channel cannot be full here.
        if let Err(e) = self.done.try_send(backend) {
            warn!(error = %e, "failed to signal request completion");
        }
    }
}

pin_project! {
    /// Response body that signals completion once it is dropped.
    struct TrackedBody {
        #[pin]
        inner: ProxyBody,
        _completion: CompletionGuard,
    }
}

impl TrackedBody {
    fn new(inner: ProxyBody, completion: CompletionGuard) -> Self {
        Self {
            inner,
            _completion: completion,
        }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
