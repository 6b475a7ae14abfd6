#![allow(dead_code)]

use async_trait::async_trait;
use proxy_sieve::{Endpoint, ErrorKind, Probe, Transport, ValidationResult};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// URL the stub proxies pretend to fetch. An IP literal, so SOCKS clients
/// never try to resolve it.
pub const VERIFY_URL: &str = "http://198.51.100.1/json";

/// How a stub answers every HTTP request it receives
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        body: String,
        delay: Duration,
    },
    /// Read the request, then never answer
    Hang,
    /// Close the connection right after accepting it
    Close,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Respond {
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Respond {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }
}

/// What a SOCKS stub does with a client
#[derive(Debug, Clone)]
pub enum Socks {
    /// Grant the CONNECT, then answer the tunnelled request with the reply
    Tunnel(Reply),
    /// Refuse the CONNECT request
    Reject,
    /// Close the connection in the middle of the greeting
    HangUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A running loopback stub and how many connections it accepted
#[derive(Debug, Clone)]
pub struct Stub {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl Stub {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self, transport: Transport) -> Endpoint {
        Endpoint::new(Ipv4Addr::LOCALHOST, self.addr.port(), transport)
    }
}

async fn accept_loop<F, Fut>(handler: F) -> Stub
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(stream));
        }
    });
    Stub { addr, connections }
}

/// Start a minimal HTTP forward proxy on loopback that answers with `reply`
pub async fn spawn_stub(reply: Reply) -> Stub {
    accept_loop(move |stream| serve_http(stream, reply.clone())).await
}

pub async fn spawn_stub_proxy(reply: Reply) -> SocketAddr {
    spawn_stub(reply).await.addr
}

/// Start a loopback SOCKS4 or SOCKS5 proxy (no authentication)
pub async fn spawn_socks_stub(version: SocksVersion, behaviour: Socks) -> Stub {
    accept_loop(move |stream| serve_socks(stream, version, behaviour.clone())).await
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    return Some(String::from_utf8_lossy(&buf).into_owned());
                }
                if buf.len() > 64 * 1024 {
                    return None;
                }
            }
        }
    }
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_http(mut stream: TcpStream, reply: Reply) {
    match reply {
        Reply::Close => drop(stream),
        Reply::Hang => {
            let _ = read_request_head(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Reply::Respond {
            status,
            body,
            delay,
        } => {
            if read_request_head(&mut stream).await.is_none() {
                return;
            }
            tokio::time::sleep(delay).await;
            write_response(&mut stream, status, &body).await;
        }
    }
}

async fn read_until_nul(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await.ok()?;
        if byte == 0 {
            return Some(out);
        }
        out.push(byte);
    }
}

/// Read a SOCKS CONNECT request; returns false when the client went away
async fn socks_handshake(stream: &mut TcpStream, version: SocksVersion, grant: bool) -> bool {
    match version {
        SocksVersion::V5 => {
            let mut greeting = [0u8; 2];
            if stream.read_exact(&mut greeting).await.is_err() {
                return false;
            }
            let mut methods = vec![0u8; greeting[1] as usize];
            if stream.read_exact(&mut methods).await.is_err() {
                return false;
            }
            if stream.write_all(&[0x05, 0x00]).await.is_err() {
                return false;
            }

            let mut head = [0u8; 4];
            if stream.read_exact(&mut head).await.is_err() {
                return false;
            }
            let addr_len = match head[3] {
                0x01 => 4,
                0x04 => 16,
                0x03 => match stream.read_u8().await {
                    Ok(len) => len as usize,
                    Err(_) => return false,
                },
                _ => return false,
            };
            let mut rest = vec![0u8; addr_len + 2];
            if stream.read_exact(&mut rest).await.is_err() {
                return false;
            }
            let code = if grant { 0x00 } else { 0x05 };
            stream
                .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .is_ok()
        }
        SocksVersion::V4 => {
            let mut head = [0u8; 8];
            if stream.read_exact(&mut head).await.is_err() {
                return false;
            }
            if read_until_nul(stream).await.is_none() {
                return false;
            }
            // SOCKS4a: 0.0.0.x followed by a domain name
            if head[4..7] == [0, 0, 0] && head[7] != 0 && read_until_nul(stream).await.is_none() {
                return false;
            }
            let code = if grant { 0x5A } else { 0x5B };
            stream
                .write_all(&[0x00, code, 0, 0, 0, 0, 0, 0])
                .await
                .is_ok()
        }
    }
}

async fn serve_socks(mut stream: TcpStream, version: SocksVersion, behaviour: Socks) {
    match behaviour {
        Socks::HangUp => {
            // swallow part of the greeting, then drop the connection
            let _ = stream.read_u8().await;
        }
        Socks::Reject => {
            let _ = socks_handshake(&mut stream, version, false).await;
        }
        Socks::Tunnel(reply) => {
            if socks_handshake(&mut stream, version, true).await {
                serve_http(stream, reply).await;
            }
        }
    }
}

/// Serve fixed bodies per path and record every request head, lowercased
pub async fn spawn_list_server(
    routes: Vec<(&'static str, u16, String)>,
) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let routes: Arc<HashMap<&'static str, (u16, String)>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, status, body)| (path, (status, body)))
            .collect(),
    );
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    let stub = accept_loop(move |mut stream| {
        let routes = Arc::clone(&routes);
        let recorded = Arc::clone(&recorded);
        async move {
            let Some(head) = read_request_head(&mut stream).await else {
                return;
            };
            let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
            recorded.lock().unwrap().push(head.to_ascii_lowercase());
            match routes.get(path.as_str()) {
                Some((status, body)) => write_response(&mut stream, *status, body).await,
                None => write_response(&mut stream, 404, "not found").await,
            }
        }
    })
    .await;
    (stub.addr, requests)
}

/// A loopback port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

pub fn loopback(addr: SocketAddr) -> Endpoint {
    Endpoint::new(Ipv4Addr::LOCALHOST, addr.port(), Transport::Http)
}

/// What a [`ScriptedProbe`] does for one port; `error: None` is a success
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub delay: Duration,
    pub error: Option<ErrorKind>,
}

impl Script {
    fn new(delay: Duration, succeed: bool) -> Self {
        Self {
            delay,
            error: (!succeed).then_some(ErrorKind::ConnectionRefused),
        }
    }
}

/// Probe whose behaviour is scripted per port; records how many probes run
/// at the same time.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    scripts: HashMap<u16, Script>,
    default: Option<Script>,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, delay: Duration, succeed: bool) -> Self {
        self.default = Some(Script::new(delay, succeed));
        self
    }

    pub fn with_port(mut self, port: u16, delay: Duration, succeed: bool) -> Self {
        self.scripts.insert(port, Script::new(delay, succeed));
        self
    }

    pub fn with_error(mut self, port: u16, error: ErrorKind) -> Self {
        self.scripts.insert(
            port,
            Script {
                delay: Duration::ZERO,
                error: Some(error),
            },
        );
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ValidationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let script = self
            .scripts
            .get(&endpoint.port)
            .copied()
            .or(self.default)
            .unwrap_or(Script::new(Duration::ZERO, true));
        tokio::time::sleep(script.delay).await;

        match script.error {
            None => ValidationResult::working(*endpoint, "203.0.113.5".to_string(), script.delay),
            Some(kind) => ValidationResult::failed(*endpoint, kind),
        }
    }
}

/// Lets tests keep a handle on a probe that the coordinator owns
pub struct Shared<P>(pub Arc<P>);

#[async_trait]
impl<P: Probe> Probe for Shared<P> {
    async fn probe(&self, endpoint: &Endpoint) -> ValidationResult {
        self.0.probe(endpoint).await
    }
}
