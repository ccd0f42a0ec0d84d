//! Frontend listener implementation.
//!
//! Accepts incoming connections and serves them with the load balancer.

use crate::backend::LoadBalancer;
use crate::metrics::MetricsCollector;
use crate::proxy::ClientAddr;
use crate::util::RequestId;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    /// TCP listener.
    listener: TcpListener,
    /// Balancer every request is dispatched through.
    balancer: Arc<LoadBalancer>,
    /// Metrics collector.
    metrics: MetricsCollector,
}

impl FrontendListener {
    /// Bind the listener to `address`.
    pub async fn bind(
        address: SocketAddr,
        balancer: Arc<LoadBalancer>,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        info!(
            listen = %listener.local_addr()?,
            backends = balancer.backends().len(),
            "frontend listener bound"
        );

        Ok(Self {
            listener,
            balancer,
            metrics,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    ///
    /// Connections already accepted keep being served after shutdown until
    /// their clients close them.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one client connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let balancer = Arc::clone(&self.balancer);
        let metrics = self.metrics.clone();
        let request_id = RequestId::short();
        let span = info_span!("connection", request_id = %request_id, client = %client_addr);

        metrics.connection_opened();

        tokio::spawn(
            async move {
                let start_time = Instant::now();

                let service = service_fn(move |mut req: Request<Incoming>| {
                    let balancer = Arc::clone(&balancer);
                    req.extensions_mut().insert(ClientAddr(client_addr));
                    async move {
                        debug!(method = %req.method(), uri = %req.uri(), "request received");
                        Ok::<_, Infallible>(balancer.serve(req).await)
                    }
                });

                let result = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await;

                metrics.connection_closed();

                let duration = start_time.elapsed();
                match result {
                    Ok(()) => debug!(duration_ms = duration.as_millis(), "connection completed"),
                    Err(e) => warn!(
                        duration_ms = duration.as_millis(),
                        error = %e,
                        "connection handling failed"
                    ),
                }
            }
            .instrument(span),
        );
    }
}
