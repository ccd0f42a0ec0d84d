//! Frontend listener.
//!
//! Accepts client connections, serves HTTP/1.1 on each of them and hands
//! every request to the load balancer.

mod listener;

pub use listener::FrontendListener;
