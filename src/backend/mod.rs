//! Backends, their load counters and the least-loaded balancer.

#[allow(clippy::module_inception)]
mod backend;
mod balancer;
mod counter;
mod pool;

pub use backend::{Backend, CompletionSender};
pub use balancer::{BalancerError, LoadBalancer, parse_upstream};
pub use counter::LoadCounter;
pub use pool::{NOT_IN_POOL, Pool, PoolEntry};
