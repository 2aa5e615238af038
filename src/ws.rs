//! WebSocket upgrade authentication and raw tunnelling.
//!
//! Upgrades never reach the HTTP stack. The connection handler reads the
//! request head off the socket, and when it is an upgrade for a
//! streaming-capable route the socket is handed to
//! [`UpgradeAuthenticator::handle`]. Rejections are literal HTTP/1.1 status
//! lines written to the socket before closing it.
//!
//! ```text
//! Received ──► TokenExtracted ──► Validated ──► TunnelEstablished
//!    │               │
//!    └──► Rejected ◄─┘
//! ```

use crate::auth::{bearer_from_headers, Claims, TokenVerifier};
use crate::dispatch::{identity_headers, IDENTITY_HEADERS};
use crate::route::{Route, RouteTable};
use crate::telemetry::{GatewayEvent, Telemetry, UpgradeEvent};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request head accepted before the connection is dropped.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Raw rejection written when no token or an invalid one is presented.
pub const UNAUTHORIZED: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\n";
/// Raw rejection written when the backend tunnel cannot be used.
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
/// Raw rejection for upgrades on a path with no streaming route.
pub const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Malformed(&'static str),
    #[error("connection closed before the request head was complete")]
    Closed,
    #[error("timed out reading the request head")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed HTTP/1.x request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target: path plus optional query.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// Offset just past the blank line ending the head, if buffered yet.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read from `io` until a full request head is buffered.
///
/// Returns everything read so far together with the head length; bytes past
/// the head belong to the request body or the tunnelled stream.
pub async fn read_head<S>(io: &mut S, limit: usize, timeout: Duration) -> Result<(Vec<u8>, usize), HeadError>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = head_end(&buf) {
                return Ok((buf, end));
            }
            if buf.len() >= limit {
                return Err(HeadError::TooLarge(limit));
            }
            let n = io.read(&mut chunk).await?;
            if n == 0 {
                return Err(HeadError::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    };
    tokio::time::timeout(timeout, read).await.map_err(|_| HeadError::Timeout)?
}

impl RequestHead {
    /// Parse a head. `raw` may include the terminating blank line.
    pub fn parse(raw: &[u8]) -> Result<Self, HeadError> {
        let text = std::str::from_utf8(raw).map_err(|_| HeadError::Malformed("not utf-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(HeadError::Malformed("empty head"))?;
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && t.starts_with('/') => (m, t, v),
            _ => return Err(HeadError::Malformed("bad request line")),
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HeadError::Malformed("unsupported http version"));
        }

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or(HeadError::Malformed("bad header line"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(HeadError::Malformed("empty header name"));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }
        Ok(Self { method: method.into(), target: target.into(), version: version.into(), headers })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(p, _)| p)
    }

    /// `Upgrade: websocket` together with `Connection: upgrade`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self.header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self
            .header("connection")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
        upgrade && connection
    }

    /// Headers as a typed map; entries that are not valid HTTP are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                map.append(n, v);
            }
        }
        map
    }

    /// Serialize with a new target and headers, ending in the blank line.
    fn encode(&self, target: &str, headers: &[(String, String)]) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, target, self.version);
        for (name, value) in headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Byte stream a tunnel can run over.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Opens the backend side of a tunnel.
#[async_trait]
pub trait TunnelConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, upstream: &Url) -> io::Result<Box<dyn TunnelIo>>;
}

/// Plain TCP to the upstream's host and port.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10) }
    }
}

#[async_trait]
impl TunnelConnector for TcpConnector {
    async fn connect(&self, upstream: &Url) -> io::Result<Box<dyn TunnelIo>> {
        let host = upstream
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "upstream has no host"))?;
        let port = upstream
            .port_or_known_default()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "upstream has no port"))?;
        let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// How an upgrade request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The tunnel ran and closed; byte counts per direction.
    Tunnelled { to_backend: u64, to_client: u64 },
    /// A raw status line was written and the socket closed.
    Rejected { status: u16 },
    /// The tunnel broke after handoff.
    TunnelFailed,
}

enum State {
    Received,
    TokenExtracted(String),
    Validated(Claims),
    Rejected(u16, &'static [u8]),
}

/// Authenticates WebSocket upgrades and splices them onto the backend.
#[derive(Debug, Clone)]
pub struct UpgradeAuthenticator {
    table: Arc<RouteTable>,
    verifier: Arc<dyn TokenVerifier>,
    connector: Arc<dyn TunnelConnector>,
    max_user_data: usize,
    telemetry: Telemetry,
}

impl UpgradeAuthenticator {
    pub fn new(
        table: Arc<RouteTable>,
        verifier: Arc<dyn TokenVerifier>,
        connector: Arc<dyn TunnelConnector>,
    ) -> Self {
        Self { table, verifier, connector, max_user_data: 4096, telemetry: Telemetry::default() }
    }

    pub fn max_user_data(mut self, bytes: usize) -> Self {
        self.max_user_data = bytes;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Whether `head` is an upgrade this authenticator should take.
    pub fn accepts(&self, head: &RequestHead) -> bool {
        head.is_websocket_upgrade() && self.table.websocket_route_for(head.path()).is_some()
    }

    /// Drive one upgrade request to completion.
    ///
    /// `buffered` holds bytes read past the head; they are replayed to the
    /// backend after the rewritten head.
    pub async fn handle<S>(&self, mut client: S, head: RequestHead, buffered: &[u8], peer: IpAddr) -> UpgradeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(route) = self.table.websocket_route_for(head.path()).cloned() else {
            return self.reject(&mut client, &head, 404, NOT_FOUND).await;
        };

        let mut state = State::Received;
        let claims = loop {
            state = match state {
                State::Received => match bearer_from_headers(&head.header_map()) {
                    Ok(token) => State::TokenExtracted(token.to_string()),
                    Err(err) => {
                        tracing::info!(client = %peer, path = head.path(), error = %err, "upgrade without usable token");
                        State::Rejected(401, UNAUTHORIZED)
                    }
                },
                State::TokenExtracted(token) => match self.verifier.verify(&token).await {
                    Ok(claims) => State::Validated(claims),
                    Err(err) => {
                        tracing::info!(client = %peer, path = head.path(), error = %err, "upgrade token rejected");
                        State::Rejected(401, UNAUTHORIZED)
                    }
                },
                State::Validated(claims) => break claims,
                State::Rejected(status, line) => return self.reject(&mut client, &head, status, line).await,
            };
        };

        self.tunnel(client, &route, &head, buffered, peer, claims).await
    }

    async fn reject<S>(&self, client: &mut S, head: &RequestHead, status: u16, line: &[u8]) -> UpgradeOutcome
    where
        S: AsyncWrite + Unpin,
    {
        write_and_close(client, line).await;
        self.telemetry
            .emit(GatewayEvent::Upgrade(UpgradeEvent::Rejected { route: head.path().to_string(), status }))
            .await;
        UpgradeOutcome::Rejected { status }
    }

    async fn tunnel<S>(
        &self,
        mut client: S,
        route: &Route,
        head: &RequestHead,
        buffered: &[u8],
        peer: IpAddr,
        claims: Claims,
    ) -> UpgradeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = route.rewrite(&head.target);
        let mut backend = match self.connector.connect(route.upstream()).await {
            Ok(backend) => backend,
            Err(err) => {
                tracing::error!(route = route.name(), url = %route.upstream(), error = %err, "could not reach websocket backend");
                return self.reject(&mut client, head, 502, BAD_GATEWAY).await;
            }
        };

        let headers = self.backend_headers(head, route, peer, &claims);
        let handoff = async {
            backend.write_all(&head.encode(&target, &headers)).await?;
            if !buffered.is_empty() {
                backend.write_all(buffered).await?;
            }
            backend.flush().await
        };
        if let Err(err) = handoff.await {
            tracing::error!(route = route.name(), error = %err, "could not hand off upgrade");
            return self.reject(&mut client, head, 502, BAD_GATEWAY).await;
        }

        tracing::info!(route = route.name(), user = claims.subject(), path = %target, "websocket tunnel established");
        self.telemetry
            .emit(GatewayEvent::Upgrade(UpgradeEvent::Accepted {
                route: route.name().to_string(),
                username: claims.subject().to_string(),
            }))
            .await;

        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((to_backend, to_client)) => {
                tracing::debug!(route = route.name(), to_backend, to_client, "websocket tunnel closed");
                UpgradeOutcome::Tunnelled { to_backend, to_client }
            }
            Err(err) => {
                tracing::warn!(route = route.name(), error = %err, "websocket tunnel failed");
                write_and_close(&mut client, BAD_GATEWAY).await;
                let _ = backend.shutdown().await;
                self.telemetry
                    .emit(GatewayEvent::Upgrade(UpgradeEvent::TunnelFailed { route: route.name().to_string() }))
                    .await;
                UpgradeOutcome::TunnelFailed
            }
        }
    }

    fn backend_headers(&self, head: &RequestHead, route: &Route, peer: IpAddr, claims: &Claims) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = head
            .headers
            .iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                lower != "host" && lower != "x-forwarded-for" && !IDENTITY_HEADERS.contains(&lower.as_str())
            })
            .cloned()
            .collect();

        let upstream = route.upstream();
        let host = match (upstream.host_str(), upstream.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        };
        headers.push(("Host".into(), host));
        let forwarded = match head.header("x-forwarded-for") {
            Some(chain) if !chain.is_empty() => format!("{}, {}", chain, peer),
            _ => peer.to_string(),
        };
        headers.push(("X-Forwarded-For".into(), forwarded));
        for (name, value) in identity_headers(claims, self.max_user_data) {
            if let Ok(value) = value.to_str() {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        headers
    }
}

/// Best-effort write of a raw status line followed by a shutdown.
async fn write_and_close<S: AsyncWrite + Unpin>(io: &mut S, line: &[u8]) {
    if let Err(err) = io.write_all(line).await {
        tracing::debug!(error = %err, "client socket no longer writable");
    }
    let _ = io.shutdown().await;
}
