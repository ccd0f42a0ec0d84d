//! leastlb - A least-loaded HTTP reverse proxy
//!
//! Every request goes to the upstream with the fewest requests in flight.
//! The crate provides:
//! - A min-heap pool of backends keyed by in-flight load
//! - Single-host HTTP/1.1 reverse proxying
//! - YAML configuration with CLI overrides
//! - Prometheus metrics

pub mod backend;
pub mod config;
pub mod frontend;
pub mod metrics;
pub mod proxy;
pub mod util;

#[cfg(test)]
mod test_support;

pub use backend::{BalancerError, LoadBalancer};
pub use config::Config;
