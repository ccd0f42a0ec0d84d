//! Shared helpers for integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// A running HTTP upstream that counts the requests it served.
pub struct TestUpstream {
    pub url: String,
    pub count: Arc<AtomicU32>,
}

impl TestUpstream {
    pub fn served(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Start an HTTP server on an ephemeral port answering with `body`.
pub async fn start_http_server(body: &'static str) -> TestUpstream {
    start(body, None).await
}

/// Start an HTTP server that waits for `gate` before each response.
pub async fn start_gated_http_server(body: &'static str, gate: Arc<Notify>) -> TestUpstream {
    start(body, Some(gate)).await
}

async fn start(body: &'static str, gate: Option<Arc<Notify>>) -> TestUpstream {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let url = format!("http://{}", listener.local_addr().unwrap());
    let count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&count);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let gate = gate.clone();

            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                    let counter = Arc::clone(&counter);
                    let gate = gate.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if let Some(gate) = gate {
                            gate.notified().await;
                        }
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                            body.as_bytes(),
                        ))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestUpstream { url, count }
}

/// Send a GET over a fresh connection and return status and body.
pub async fn http_get(address: SocketAddr, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(address).await.expect("failed to connect");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("handshake failed");
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, address.to_string())
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.expect("request failed");
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status, String::from_utf8(body.to_vec()).unwrap())
}
