//! Prometheus metrics HTTP server.
//!
//! Serves metrics on a configurable HTTP endpoint.

use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    /// Bound listener.
    listener: TcpListener,
    /// Path for metrics endpoint.
    path: String,
    /// Metrics collector.
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the metrics server.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path,
            collector,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the metrics server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(address) = self.listener.local_addr() {
            info!(address = %address, path = %self.path, "metrics server started");
        }

        let collector = Arc::new(self.collector);
        let path = Arc::new(self.path);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let collector = Arc::clone(&collector);
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let collector = Arc::clone(&collector);
                                    let path = Arc::clone(&path);
                                    async move {
                                        handle_request(req, &collector, &path).await
                                    }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle an incoming metrics request.
async fn handle_request<B>(
    req: Request<B>,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed\n".to_string(),
        ));
    }

    if path == metrics_path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics\n".to_string(),
            ));
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(buffer)))
            .unwrap())
    } else if path == "/health" || path == "/healthz" {
        Ok(text_response(StatusCode::OK, "OK\n".to_string()))
    } else if path == "/" {
        let body = format!(
            "leastlb metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Liveness check\n",
            metrics_path
        );
        Ok(text_response(StatusCode::OK, body))
    } else {
        Ok(text_response(StatusCode::NOT_FOUND, "Not found\n".to_string()))
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
