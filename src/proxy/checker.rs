//! Proxy checker module: routes one verification request through a candidate
//!
//! HTTP proxies are exercised with a one-off reqwest client. SOCKS proxies
//! are driven step by step (TCP connect, SOCKS handshake, then HTTP/1.1 over
//! the tunnel) so a dead socket is told apart from a broken handshake.

use crate::proxy::models::{Endpoint, ErrorKind, Transport, ValidationResult};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{CONNECTION, CONTENT_LENGTH, HOST};
use hyper::HeaderMap;
use hyper_util::rt::TokioIo;
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode, Url};
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

/// Default timeout for proxy checks in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default "echo my IP" service; answers `{"query": "<ip>", ...}`
pub const DEFAULT_VERIFICATION_URL: &str = "http://ip-api.com/json/?fields=8217";

/// Largest verification body read from a proxy; anything bigger is malformed
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Field of the verification response that carries the exit IP
const IP_FIELD: &str = "query";

/// Anything that can validate a single endpoint.
///
/// Implementations must never fail outward: every problem becomes a
/// `succeeded = false` result.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, endpoint: &Endpoint) -> ValidationResult;
}

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each proxy check, connect through body
    pub timeout: Duration,
    /// URL fetched through each proxy
    pub verification_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            verification_url: DEFAULT_VERIFICATION_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verification_url(mut self, url: impl Into<String>) -> Self {
        self.verification_url = url.into();
        self
    }
}

/// Validates proxies by fetching the verification URL through them
#[derive(Debug, Clone, Default)]
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    /// Create a new proxy checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new proxy checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check a single proxy. Exactly one attempt, no retries.
    pub async fn check_proxy(&self, endpoint: &Endpoint) -> ValidationResult {
        let start = Instant::now();
        let attempt = self.fetch_exit_ip(endpoint);

        let result = match tokio::time::timeout(self.config.timeout, attempt).await {
            Ok(Ok(ip)) => ValidationResult::working(*endpoint, ip, start.elapsed()),
            Ok(Err(kind)) => ValidationResult::failed(*endpoint, kind),
            Err(_) => ValidationResult::timeout(*endpoint),
        };

        match &result.error {
            None => debug!(
                "✓ {} working, ip {}, {}ms",
                endpoint,
                result.reported_ip.as_deref().unwrap_or_default(),
                start.elapsed().as_millis()
            ),
            Some(kind) => debug!("✗ {} {}, {}ms", endpoint, kind, start.elapsed().as_millis()),
        }
        result
    }

    async fn fetch_exit_ip(&self, endpoint: &Endpoint) -> std::result::Result<String, ErrorKind> {
        let url =
            Url::parse(&self.config.verification_url).map_err(|_| ErrorKind::HandshakeFailed)?;
        match endpoint.transport {
            // TLS verification targets still go through reqwest
            Transport::Socks4 | Transport::Socks5 if url.scheme() == "http" => {
                self.fetch_through_socks(endpoint, &url).await
            }
            _ => self.fetch_with_client(endpoint).await,
        }
    }

    async fn fetch_with_client(
        &self,
        endpoint: &Endpoint,
    ) -> std::result::Result<String, ErrorKind> {
        let client = self
            .create_client(endpoint)
            .map_err(|e| classify_setup_error(&e))?;

        let mut response = client
            .get(&self.config.verification_url)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, endpoint.transport))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ErrorKind::HttpStatus(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > MAX_BODY_BYTES as u64) {
            return Err(ErrorKind::MalformedBody);
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_request_error(&e, endpoint.transport))?
        {
            append_capped(&mut body, &chunk)?;
        }
        extract_reported_ip(&body)
    }

    /// Create a one-off reqwest client routed through the endpoint
    fn create_client(&self, endpoint: &Endpoint) -> Result<Client> {
        let proxy_url = endpoint.url();

        // `all` so an https verification URL is tunnelled with CONNECT too
        let reqwest_proxy = ReqwestProxy::all(&proxy_url)?;

        let client = Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.config.timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(client)
    }

    async fn fetch_through_socks(
        &self,
        endpoint: &Endpoint,
        url: &Url,
    ) -> std::result::Result<String, ErrorKind> {
        let host = url.host_str().ok_or(ErrorKind::HandshakeFailed)?;
        let port = url.port_or_known_default().unwrap_or(80);

        let socket = TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(|e| classify_io(&e).unwrap_or(ErrorKind::ConnectionRefused))?;

        let stream = match endpoint.transport {
            Transport::Socks4 => Socks4Stream::connect_with_socket(socket, (host, port))
                .await
                .map(Socks4Stream::into_inner),
            _ => Socks5Stream::connect_with_socket(socket, (host, port))
                .await
                .map(Socks5Stream::into_inner),
        }
        .map_err(|e| classify_socks_error(&e))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| classify_hyper_error(&e))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let request = hyper::Request::get(path)
            .header(HOST, authority)
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|_| ErrorKind::HandshakeFailed)?;

        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| classify_hyper_error(&e))?;

            let status = response.status();
            if status != StatusCode::OK {
                return Err(ErrorKind::HttpStatus(status.as_u16()));
            }
            if declared_length(response.headers()).is_some_and(|len| len > MAX_BODY_BYTES as u64) {
                return Err(ErrorKind::MalformedBody);
            }

            let mut body = response.into_body();
            let mut buf = Vec::new();
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| classify_hyper_error(&e))?;
                if let Some(chunk) = frame.data_ref() {
                    append_capped(&mut buf, chunk)?;
                }
            }
            extract_reported_ip(&buf)
        };
        tokio::pin!(exchange);

        // The connection is driven here rather than spawned, so dropping the
        // probe on timeout closes the socket.
        tokio::select! {
            biased;

            result = &mut exchange => result,
            closed = conn => match closed {
                Ok(()) => exchange.await,
                Err(e) => Err(classify_hyper_error(&e)),
            },
        }
    }
}

#[async_trait]
impl Probe for ProxyChecker {
    async fn probe(&self, endpoint: &Endpoint) -> ValidationResult {
        self.check_proxy(endpoint).await
    }
}

/// Judge a verification response body.
///
/// The body must be a JSON object whose `query` field is a non-empty string.
/// Some dead proxies answer 200 with an empty payload, so an empty IP is a
/// failure.
pub fn extract_reported_ip(body: &[u8]) -> std::result::Result<String, ErrorKind> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ErrorKind::MalformedBody)?;
    let object = value.as_object().ok_or(ErrorKind::MalformedBody)?;
    match object.get(IP_FIELD).and_then(|v| v.as_str()).map(str::trim) {
        Some(ip) if !ip.is_empty() => Ok(ip.to_string()),
        _ => Err(ErrorKind::MissingIpField),
    }
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8]) -> std::result::Result<(), ErrorKind> {
    if buf.len() + chunk.len() > MAX_BODY_BYTES {
        return Err(ErrorKind::MalformedBody);
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// EMFILE, ENFILE, ENOBUFS
#[cfg(unix)]
const EXHAUSTION_ERRNOS: &[i32] = &[24, 23, 105];
// WSAEMFILE, WSAENOBUFS
#[cfg(windows)]
const EXHAUSTION_ERRNOS: &[i32] = &[10024, 10055];
#[cfg(not(any(unix, windows)))]
const EXHAUSTION_ERRNOS: &[i32] = &[];

fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

fn classify_io(io_err: &io::Error) -> Option<ErrorKind> {
    if let Some(code) = io_err.raw_os_error() {
        if EXHAUSTION_ERRNOS.contains(&code) {
            return Some(ErrorKind::ResourceExhausted);
        }
    }
    match io_err.kind() {
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorKind::ConnectionRefused),
        _ => None,
    }
}

/// The TCP connection is up by the time the SOCKS handshake runs, so only
/// local exhaustion and timeouts keep their own kind.
fn classify_socks_error(err: &tokio_socks::Error) -> ErrorKind {
    match err {
        tokio_socks::Error::Io(io_err) => match classify_io(io_err) {
            Some(kind @ (ErrorKind::ResourceExhausted | ErrorKind::Timeout)) => kind,
            _ => ErrorKind::HandshakeFailed,
        },
        _ => ErrorKind::HandshakeFailed,
    }
}

fn classify_hyper_error(err: &hyper::Error) -> ErrorKind {
    if err.is_parse() {
        return ErrorKind::MalformedBody;
    }
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    find_io_error(err)
        .and_then(classify_io)
        .unwrap_or(ErrorKind::ConnectionRefused)
}

/// Client construction fails before any socket is opened: bad proxy URL,
/// unsupported scheme or TLS backend initialisation.
fn classify_setup_error(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|e| e.downcast_ref::<io::Error>())
        .and_then(classify_io)
        .unwrap_or(ErrorKind::HandshakeFailed)
}

fn classify_request_error(err: &reqwest::Error, transport: Transport) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if let Some(kind) = find_io_error(err).and_then(classify_io) {
        return kind;
    }
    if err.is_connect() {
        // Plain HTTP proxying has no handshake beyond TCP
        return match transport {
            Transport::Http => ErrorKind::ConnectionRefused,
            Transport::Socks4 | Transport::Socks5 => ErrorKind::HandshakeFailed,
        };
    }
    ErrorKind::ConnectionRefused
}
