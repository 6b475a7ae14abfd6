//! Proxy data models

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Proxying protocol spoken by an endpoint
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    #[value(alias = "https")]
    Http,
    Socks4,
    Socks5,
}

impl Transport {
    pub const ALL: [Transport; 3] = [Transport::Http, Transport::Socks4, Transport::Socks5];

    /// URL scheme used in the canonical `transport://host:port` form
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Socks4 => "socks4",
            Transport::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Transport {
    type Err = ParseError;

    /// `https` is accepted as an alias of HTTP: public "https" lists are plain
    /// HTTP proxies that support CONNECT.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Transport::Http),
            "socks4" => Ok(Transport::Socks4),
            "socks5" => Ok(Transport::Socks5),
            _ => Err(ParseError::UnknownTransport(s.to_string())),
        }
    }
}

/// Errors raised while turning untrusted strings into endpoints
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown transport `{0}` (expected http, https, socks4 or socks5)")]
    UnknownTransport(String),
    #[error("malformed endpoint `{0}` (expected [transport://]a.b.c.d:port)")]
    Malformed(String),
    #[error("invalid IPv4 host in `{0}`")]
    InvalidHost(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<ParseError>,
    },
}

/// A candidate proxy socket address plus the transport used to talk to it.
///
/// Identity (`Eq`/`Hash`) is the socket address only; the transport is
/// metadata that changes how the endpoint is probed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: Ipv4Addr,
    pub port: u16,
    pub transport: Transport,
}

impl Endpoint {
    pub fn new(host: Ipv4Addr, port: u16, transport: Transport) -> Self {
        Self {
            host,
            port,
            transport,
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    /// Proxy URL handed to the HTTP client
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.transport, self.host, self.port)
    }

    /// `host:port` without the transport
    pub fn to_simple_string(&self) -> String {
        self.socket_addr().to_string()
    }

    pub(crate) fn probe_key(&self) -> (SocketAddrV4, Transport) {
        (self.socket_addr(), self.transport)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Why a probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Error)]
pub enum ErrorKind {
    #[error("connection refused or reset")]
    ConnectionRefused,
    #[error("timed out")]
    Timeout,
    #[error("proxy handshake failed")]
    HandshakeFailed,
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("response body is not a JSON object")]
    MalformedBody,
    #[error("response has no IP field")]
    MissingIpField,
    #[error("local socket or file descriptor limit reached")]
    ResourceExhausted,
    #[error("probe task panicked")]
    ProbePanicked,
}

/// Outcome of probing one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub endpoint: Endpoint,
    pub succeeded: bool,
    pub reported_ip: Option<String>,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Option<Duration>,
    pub error: Option<ErrorKind>,
}

fn serialize_millis<S: Serializer>(latency: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match latency {
        Some(latency) => s.serialize_some(&(latency.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

impl ValidationResult {
    pub fn working(endpoint: Endpoint, reported_ip: String, latency: Duration) -> Self {
        Self {
            endpoint,
            succeeded: true,
            reported_ip: Some(reported_ip),
            latency: Some(latency),
            error: None,
        }
    }

    pub fn failed(endpoint: Endpoint, error: ErrorKind) -> Self {
        Self {
            endpoint,
            succeeded: false,
            reported_ip: None,
            latency: None,
            error: Some(error),
        }
    }

    pub fn timeout(endpoint: Endpoint) -> Self {
        Self::failed(endpoint, ErrorKind::Timeout)
    }

    pub fn is_working(&self) -> bool {
        self.succeeded
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency.map(|d| d.as_millis() as u64)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.reported_ip, self.latency_ms()) {
            (None, Some(ip), Some(ms)) => {
                write!(f, "{} ok, exit ip {} ({}ms)", self.endpoint, ip, ms)
            }
            (Some(kind), _, _) => write!(f, "{} failed: {}", self.endpoint, kind),
            _ => write!(f, "{} ok", self.endpoint),
        }
    }
}

/// Endpoints submitted together for one validation run.
///
/// Duplicates of the same socket address and transport collapse into one
/// entry. The same socket address under two transports is kept twice because
/// the probes behave differently.
#[derive(Debug, Clone, Default)]
pub struct CandidateBatch {
    endpoints: Vec<Endpoint>,
    seen: HashSet<(SocketAddrV4, Transport)>,
}

impl CandidateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the endpoint was already present
    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        if self.seen.insert(endpoint.probe_key()) {
            self.endpoints.push(endpoint);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn extend<I: IntoIterator<Item = Endpoint>>(&mut self, endpoints: I) {
        for endpoint in endpoints {
            self.insert(endpoint);
        }
    }
}

impl FromIterator<Endpoint> for CandidateBatch {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        let mut batch = CandidateBatch::new();
        batch.extend(iter);
        batch
    }
}

impl IntoIterator for CandidateBatch {
    type Item = Endpoint;
    type IntoIter = std::vec::IntoIter<Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.into_iter()
    }
}

/// Endpoints whose latest probe in the current run succeeded
#[derive(Debug, Clone, Default)]
pub struct VerifiedSet {
    endpoints: HashSet<Endpoint>,
}

impl VerifiedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful result. Returns `true` only the first time a
    /// socket address is verified in this run.
    pub fn record(&mut self, result: &ValidationResult) -> bool {
        result.succeeded && self.endpoints.insert(result.endpoint)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The verified endpoints as the next batch (used by double-check)
    pub fn into_batch(self) -> CandidateBatch {
        self.endpoints.into_iter().collect()
    }
}
