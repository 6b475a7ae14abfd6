//! Proxy Sieve - collects candidate proxies from public lists and keeps the
//! ones that actually relay traffic.
//!
//! The validation core lives in [`proxy`]: a probe per endpoint, a shared
//! concurrency governor and a coordinator that streams results in completion
//! order. Everything else (sources, sinks, configuration, scheduling) is
//! plumbing around it.

pub mod config;
pub mod database;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod sink;

pub use proxy::*;

/// Application result type
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
