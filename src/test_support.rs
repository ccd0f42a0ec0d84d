//! In-process upstream servers for unit tests.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// A request as received by a test upstream.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Handle to a running test upstream.
pub struct Upstream {
    /// Base URL, e.g. `http://127.0.0.1:41234`.
    pub url: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl Upstream {
    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

/// A bodiless GET request.
pub fn get(uri: &str) -> Request<Empty<Bytes>> {
    Request::builder().uri(uri).body(Empty::new()).unwrap()
}

/// Start an upstream that answers every request with `body`.
pub async fn spawn_upstream(body: &'static str) -> Upstream {
    start(body, None, &[]).await
}

/// Start an upstream that adds `headers` to every response.
pub async fn spawn_upstream_with_headers(
    body: &'static str,
    headers: &'static [(&'static str, &'static str)],
) -> Upstream {
    start(body, None, headers).await
}

/// Start an upstream that records each request, then holds the response
/// until the returned gate is notified once per request.
pub async fn spawn_gated_upstream(body: &'static str) -> (Upstream, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    let upstream = start(body, Some(Arc::clone(&gate)), &[]).await;
    (upstream, gate)
}

async fn start(
    body: &'static str,
    gate: Option<Arc<Notify>>,
    headers: &'static [(&'static str, &'static str)],
) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorder = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let recorder = Arc::clone(&recorder);
            let gate = gate.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let recorder = Arc::clone(&recorder);
                    let gate = gate.clone();
                    async move {
                        let (parts, incoming) = req.into_parts();
                        let received = incoming
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();

                        recorder.lock().push(SeenRequest {
                            method: parts.method,
                            path: parts.uri.path().to_string(),
                            query: parts.uri.query().map(str::to_string),
                            headers: parts.headers,
                            body: received,
                        });

                        if let Some(gate) = gate {
                            gate.notified().await;
                        }

                        let mut response = Response::builder();
                        for (name, value) in headers {
                            response = response.header(*name, *value);
                        }
                        Ok::<_, Infallible>(
                            response
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap(),
                        )
                    }
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { url, seen }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
