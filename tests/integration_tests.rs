//! Integration tests for leastlb.
//!
//! These tests run the frontend listener against real upstream servers.

mod common;

use common::{http_get, start_gated_http_server, start_http_server};
use hyper::StatusCode;
use leastlb::LoadBalancer;
use leastlb::config::{ProxyConfig, load_config};
use leastlb::frontend::FrontendListener;
use leastlb::metrics::{MetricsCollector, MetricsServer};
use leastlb::util::ShutdownSignal;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Notify;

async fn start_listener(
    backends: &[&str],
    proxy: ProxyConfig,
    metrics: MetricsCollector,
    shutdown: &ShutdownSignal,
) -> SocketAddr {
    let balancer = LoadBalancer::with_config(backends, &proxy, metrics.clone())
        .expect("failed to create load balancer");
    let listener = FrontendListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(balancer),
        metrics,
    )
    .await
    .expect("failed to bind listener");
    let address = listener.local_addr().unwrap();

    tokio::spawn(listener.run(shutdown.subscribe()));
    address
}

#[tokio::test]
async fn test_requests_spread_over_backends() {
    let one = start_http_server("one").await;
    let two = start_http_server("two").await;
    let shutdown = ShutdownSignal::new();
    let address = start_listener(
        &[one.url.as_str(), two.url.as_str()],
        ProxyConfig::default(),
        MetricsCollector::new(),
        &shutdown,
    )
    .await;

    for _ in 0..10 {
        let (status, body) = http_get(address, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body == "one" || body == "two", "unexpected body {body}");
    }

    assert_eq!(one.served() + two.served(), 10);
    assert_eq!(one.served(), 5);
    assert_eq!(two.served(), 5);

    assert_eq!(shutdown.shutdown(), 1);
}

#[tokio::test]
async fn test_busy_backend_is_skipped() {
    let gate = Arc::new(Notify::new());
    let slow = start_gated_http_server("slow", Arc::clone(&gate)).await;
    let fast = start_http_server("fast").await;
    let shutdown = ShutdownSignal::new();
    let address = start_listener(
        &[slow.url.as_str(), fast.url.as_str()],
        ProxyConfig::default(),
        MetricsCollector::new(),
        &shutdown,
    )
    .await;

    // Keep requesting until one of them is held by the slow backend.
    let mut held = Vec::new();
    while slow.served() == 0 {
        held.push(tokio::spawn(http_get(address, "/")));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for _ in 0..5 {
        let (status, body) = http_get(address, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "fast");
    }
    assert_eq!(slow.served(), 1);

    gate.notify_one();
    for handle in held {
        let (status, _) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_exhausted_pool_returns_503() {
    let gate = Arc::new(Notify::new());
    let upstream = start_gated_http_server("held", Arc::clone(&gate)).await;
    let shutdown = ShutdownSignal::new();
    let proxy = ProxyConfig {
        queue_timeout: Duration::from_millis(100),
        ..ProxyConfig::default()
    };
    let address = start_listener(
        &[upstream.url.as_str()],
        proxy,
        MetricsCollector::new(),
        &shutdown,
    )
    .await;

    let first = tokio::spawn(http_get(address, "/first"));
    while upstream.served() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, body) = http_get(address, "/second").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("No backend available"));

    gate.notify_one();
    let (status, body) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "held");

    // The backend is back in the pool; the stored permit lets it answer.
    gate.notify_one();
    let (status, _) = http_get(address, "/third").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    let shutdown = ShutdownSignal::new();
    let address = start_listener(
        &["http://127.0.0.1:9"],
        ProxyConfig::default(),
        MetricsCollector::new(),
        &shutdown,
    )
    .await;

    for _ in 0..3 {
        let (status, _) = http_get(address, "/").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}

#[tokio::test]
async fn test_metrics_endpoint_reports_requests() {
    let upstream = start_http_server("ok").await;
    let metrics = MetricsCollector::new();
    let shutdown = ShutdownSignal::new();
    let address = start_listener(
        &[upstream.url.as_str()],
        ProxyConfig::default(),
        metrics.clone(),
        &shutdown,
    )
    .await;

    let server = MetricsServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        "/metrics".to_string(),
        metrics,
    )
    .await
    .unwrap();
    let metrics_address = server.local_addr().unwrap();
    tokio::spawn(server.run(shutdown.subscribe()));

    let (status, _) = http_get(address, "/").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = http_get(metrics_address, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("leastlb_requests_total{"));
    assert!(body.contains("status=\"200\""));
    assert!(body.contains("leastlb_backend_load"));

    assert_eq!(shutdown.shutdown(), 2);
}

#[test]
fn test_config_parsing() {
    let config_content = r#"
global:
  log_level: info
  log_format: pretty

listen: "127.0.0.1:0"

backends:
  - "http://127.0.0.1:9001"
  - "http://127.0.0.1:9002/api"

proxy:
  queue_timeout: 5s
"#;

    let mut temp_file = NamedTempFile::new().expect("failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("failed to write config");

    let config = load_config(temp_file.path()).expect("failed to load config");

    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.proxy.queue_timeout, Duration::from_secs(5));
    assert_eq!(config.proxy.connect_timeout, Duration::from_secs(10));
}

#[test]
fn test_config_validation_rejects_bad_backend() {
    let config_content = r#"
backends:
  - "http://%%%%.com"
  - "ftp://127.0.0.1:21"
"#;

    let mut temp_file = NamedTempFile::new().expect("failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("failed to write config");

    let err = load_config(temp_file.path()).unwrap_err().to_string();
    assert!(err.contains("http://%%%%.com"));
    assert!(err.contains("ftp"));
}
