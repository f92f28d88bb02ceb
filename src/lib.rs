//! Proxyrelay - resilient outbound HTTP through validated free proxies
//!
//! ## Features
//!
//! - Candidate discovery from a public proxy listing
//! - Concurrent validation with egress-IP and liveness probes, ranked by latency
//! - Named client groups, direct or proxied, with an atomically swapped pool
//! - Transport and application level retries with jittered exponential backoff
//! - Periodic pool re-validation

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{ProxyError, Result};
