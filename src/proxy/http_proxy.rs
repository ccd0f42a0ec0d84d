//! Single-host HTTP reverse proxy.
//!
//! Rewrites an inbound request onto one upstream base URL and relays the
//! upstream response back unchanged apart from hop-by-hop headers.

use crate::config::ProxyConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};
use url::{Host, Url};

/// Response body type produced by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Address of the client that sent a request.
///
/// The frontend listener stores this as a request extension; the proxy uses
/// it for `X-Forwarded-For`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// HTTP proxy error.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to backend: {0}")]
    BackendConnectError(#[from] std::io::Error),

    #[error("timed out connecting to backend after {0:?}")]
    ConnectTimeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper::Error),

    #[error("invalid upstream request URI: {0}")]
    InvalidUri(String),
}

/// Headers that only apply to a single connection and must not be forwarded.
const HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to a single upstream.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    target: Url,
    /// Host to dial, without IPv6 brackets.
    connect_host: String,
    port: u16,
    authority: Option<HeaderValue>,
    connect_timeout: Duration,
}

impl ReverseProxy {
    /// Create a proxy for `target`, an `http` URL with a host.
    pub fn new(target: Url, config: &ProxyConfig) -> Self {
        let connect_host = match target.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        let port = target.port_or_known_default().unwrap_or(80);

        let authority = target.host_str().and_then(|host| {
            let authority = match target.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            HeaderValue::from_str(&authority).ok()
        });

        Self {
            target,
            connect_host,
            port,
            authority,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Upstream base URL.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Rewrite `req` so it can be sent to the upstream.
    ///
    /// The URI becomes origin-form with the upstream base path joined in
    /// front of the inbound path and the queries merged. Hop-by-hop headers
    /// are removed, the client address is appended to `X-Forwarded-For`, and
    /// a `Host` header is added only if the request carries none.
    pub fn director<B>(&self, req: &mut Request<B>) -> Result<(), ProxyError> {
        let path = join_paths(self.target.path(), req.uri().path());
        let query = merge_queries(self.target.query(), req.uri().query());
        let path_and_query = match query {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        *req.uri_mut() = path_and_query
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidUri(e.to_string()))?;

        let client = req.extensions().get::<ClientAddr>().copied();
        let headers = req.headers_mut();
        remove_hop_headers(headers);

        if let Some(ClientAddr(addr)) = client {
            append_forwarded_for(headers, addr);
        }

        if !headers.contains_key(header::HOST) {
            if let Some(authority) = &self.authority {
                headers.insert(header::HOST, authority.clone());
            }
        }

        Ok(())
    }

    /// Send `req` to the upstream and return its response.
    #[instrument(skip_all, fields(
        method = %req.method(),
        uri = %req.uri(),
        upstream = %self.target
    ))]
    pub async fn forward<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.director(&mut req)?;

        let connect = TcpStream::connect((self.connect_host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::ConnectTimeout(self.connect_timeout))??;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "backend connection error");
            }
        });

        let response = sender.send_request(req).await?;
        let (mut parts, body) = response.into_parts();
        remove_hop_headers(&mut parts.headers);

        debug!(status = parts.status.as_u16(), "upstream responded");

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Join the upstream base path and the request path with exactly one slash.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Merge the upstream base query with the request query.
fn merge_queries(base: Option<&str>, query: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(base), Some(query)) => Some(format!("{}&{}", base, query)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Append the client IP to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Create a plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}: {}\n", status, message)))
        .map_err(|never| match never {})
        .boxed();

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body)
        .unwrap()
}
