//! Proxy module for parsing and validating proxies
//!
//! This module provides functionality for:
//! - Parsing endpoints from `transport://host:port` or bare `host:port` strings
//! - Extracting endpoints from arbitrary text and crawling proxy lists
//! - Probing each endpoint through a verification service
//! - Bounding concurrent probes and streaming results as they complete

pub mod checker;
pub mod coordinator;
pub mod crawler;
pub mod extractor;
pub mod governor;
pub mod models;
pub mod parser;

pub use checker::{CheckerConfig, Probe, ProxyChecker};
pub use coordinator::{BatchCoordinator, BatchSummary, CoordinatorOptions, ValidationStream};
pub use crawler::{CrawlerConfig, ProxyCrawler, ProxySource};
pub use extractor::extract_endpoints;
pub use governor::{Governor, Permit};
pub use models::{
    CandidateBatch, Endpoint, ErrorKind, ParseError, Transport, ValidationResult, VerifiedSet,
};
pub use parser::ProxyParser;
