//! Reverse proxy forwarding to a single upstream.

mod http_proxy;

pub use http_proxy::{ClientAddr, ProxyBody, ProxyError, ReverseProxy, error_response};
