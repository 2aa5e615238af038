//! Forwarding admitted requests to their backend, with retries.
//!
//! The [`Dispatcher`] rewrites the path, swaps client-supplied identity
//! headers for the gateway's own, and runs the exchange under a
//! [`RetryPolicy`]. Transport failures and 5xx/429 answers are retried;
//! any other answer (including 4xx) is returned to the client as-is.

use crate::auth::Claims;
use crate::error::{GatewayError, RetryError};
use crate::retry::RetryPolicy;
use crate::route::{Route, RouteTable};
use crate::telemetry::{GatewayEvent, RetryEvent, Telemetry};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::Url;
use std::convert::Infallible;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;

/// Identity headers the gateway sets; client-supplied copies are dropped.
pub const IDENTITY_HEADERS: [&str; 4] = ["username", "email", "role", "userdata"];

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Coarse classification of a failed exchange with a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectionRefused,
    Timeout,
    Reset,
    Dns,
    Connect,
    Other,
}

impl TransportKind {
    /// Network-level failures worth another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, TransportKind::Other)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::ConnectionRefused => "connection refused",
            TransportKind::Timeout => "timed out",
            TransportKind::Reset => "connection reset",
            TransportKind::Dns => "dns lookup failed",
            TransportKind::Connect => "connect failed",
            TransportKind::Other => "transport error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// One outbound exchange, fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    fn is_retryable(&self) -> bool {
        self.status.is_server_error() || self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            if !is_hop_by_hop(name) && name != header::CONTENT_LENGTH {
                headers.append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// HTTP client seam; production uses [`ReqwestUpstream`].
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
}

/// `reqwest`-backed upstream client.
#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    /// Client with a per-attempt timeout. Redirects are passed back to the caller.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::new(TransportKind::Other, e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        Ok(UpstreamResponse { status, headers, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportKind::Timeout
    } else if let Some(kind) = source_kind(&err) {
        kind
    } else if err.is_connect() {
        TransportKind::Connect
    } else if err.is_request() || err.is_body() {
        TransportKind::Reset
    } else {
        TransportKind::Other
    };
    TransportError::new(kind, err.to_string())
}

/// Look through the error chain for the underlying socket or resolver failure.
fn source_kind(err: &(dyn std::error::Error + 'static)) -> Option<TransportKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionRefused => return Some(TransportKind::ConnectionRefused),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => return Some(TransportKind::Reset),
                ErrorKind::TimedOut => return Some(TransportKind::Timeout),
                _ => {}
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() || h.is_canceled() {
                return Some(TransportKind::Reset);
            }
        }
        if e.to_string().contains("dns error") {
            return Some(TransportKind::Dns);
        }
        current = e.source();
    }
    None
}

/// Why one attempt did not produce a final answer.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    Transport(TransportError),
    /// 5xx or 429 from the backend.
    Status(UpstreamResponse),
}

impl AttemptFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Transport(e) => e.is_retryable(),
            AttemptFailure::Status(r) => r.is_retryable(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Transport(e) => write!(f, "{}", e),
            AttemptFailure::Status(r) => write!(f, "backend answered {}", r.status),
        }
    }
}

/// An admitted request on its way to a backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Gateway path and query, before rewriting.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub claims: Option<Claims>,
    pub peer: IpAddr,
    pub request_id: String,
}

/// Forwards requests under a retry policy.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    upstream: Arc<dyn Upstream>,
    policy: RetryPolicy<AttemptFailure>,
    max_user_data: usize,
    telemetry: Telemetry,
}

impl Dispatcher {
    pub fn new(upstream: Arc<dyn Upstream>, policy: RetryPolicy<AttemptFailure>) -> Self {
        Self { upstream, policy, max_user_data: 4096, telemetry: Telemetry::default() }
    }

    /// Byte ceiling for the serialized `userData` header.
    pub fn max_user_data(mut self, bytes: usize) -> Self {
        self.max_user_data = bytes;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> &RetryPolicy<AttemptFailure> {
        &self.policy
    }

    /// Forward `request` to `route`'s backend.
    ///
    /// Backend answers that are not retryable come back as `Ok`, whatever
    /// their status; only transport failures and exhaustion become errors.
    pub async fn dispatch(
        &self,
        route: &Route,
        request: ForwardRequest,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = route.target(&request.path_and_query).map_err(|e| {
            tracing::error!(route = route.name(), error = %e, "could not build target url");
            GatewayError::BadGateway(TransportError::new(TransportKind::Other, e.to_string()))
        })?;
        let target = url.to_string();
        let outbound = UpstreamRequest {
            method: request.method.clone(),
            headers: self.outbound_headers(&request),
            url,
            body: request.body,
        };

        let attempts = AtomicUsize::new(0);
        let result = self
            .policy
            .execute(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let outbound = outbound.clone();
                let target = &target;
                async move {
                    let failure = match self.upstream.send(outbound).await {
                        Ok(response) if response.is_retryable() => AttemptFailure::Status(response),
                        Ok(response) => return Ok(response),
                        Err(err) => AttemptFailure::Transport(err),
                    };
                    self.telemetry
                        .emit(GatewayEvent::Retry(RetryEvent::AttemptFailed {
                            target: target.clone(),
                            attempt,
                            retryable: failure.is_retryable(),
                        }))
                        .await;
                    Err(failure)
                }
            })
            .await;

        match result {
            Ok(response) => {
                if response.status.is_client_error() {
                    tracing::info!(url = %target, status = %response.status, "backend rejected request");
                }
                Ok(response)
            }
            Err(RetryError::Aborted(failure)) => match failure {
                AttemptFailure::Transport(err) => {
                    tracing::error!(url = %target, error = %err, "non-retryable transport failure");
                    Err(GatewayError::BadGateway(err))
                }
                // Only when the policy's predicate declines to retry a 5xx/429.
                AttemptFailure::Status(response) => {
                    tracing::warn!(url = %target, status = %response.status, "backend failure not retried");
                    Ok(response)
                }
            },
            Err(RetryError::Exhausted { attempts, .. }) => {
                self.telemetry
                    .emit(GatewayEvent::Retry(RetryEvent::Exhausted { target: target.clone(), attempts }))
                    .await;
                tracing::error!(url = %target, attempts, request_id = %request.request_id, "backend unavailable");
                Err(GatewayError::RetryExhausted { attempts })
            }
        }
    }

    fn outbound_headers(&self, request: &ForwardRequest) -> HeaderMap {
        let mut headers = strip_headers(&request.headers);
        append_forwarded_for(&mut headers, &request.headers, request.peer);
        if let Ok(id) = HeaderValue::from_str(&request.request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), id);
        }
        if let Some(claims) = &request.claims {
            self.insert_identity(&mut headers, claims);
        }
        headers
    }

    fn insert_identity(&self, headers: &mut HeaderMap, claims: &Claims) {
        for (name, value) in identity_headers(claims, self.max_user_data) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Headers describing the caller to a backend: `username`, `email`, `role`
/// and the serialized claims as `userdata`, the last one only when it fits
/// in `max_user_data` bytes.
pub(crate) fn identity_headers(claims: &Claims, max_user_data: usize) -> Vec<(&'static str, HeaderValue)> {
    let mut out = Vec::with_capacity(4);
    let mut set = |name: &'static str, value: &str| match HeaderValue::from_str(value) {
        Ok(v) => out.push((name, v)),
        Err(_) => {
            tracing::warn!(header = name, "identity value is not a valid header, omitted");
        }
    };
    set("username", claims.subject());
    if let Some(email) = &claims.email {
        set("email", email);
    }
    set("role", claims.role.as_str());

    match serde_json::to_string(claims) {
        Ok(json) if json.len() <= max_user_data => set("userdata", &json),
        Ok(json) => tracing::warn!(
            user = claims.subject(),
            size = json.len(),
            limit = max_user_data,
            "userData header too large, omitted"
        ),
        Err(e) => tracing::warn!(error = %e, "could not serialize claims"),
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy client headers minus hop-by-hop, `Host`, length and identity headers.
fn strip_headers(incoming: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = incoming
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming.iter() {
        let lower = name.as_str();
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || IDENTITY_HEADERS.contains(&lower)
            || lower == "x-forwarded-for"
            || listed.iter().any(|l| l == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn append_forwarded_for(out: &mut HeaderMap, incoming: &HeaderMap, peer: IpAddr) {
    let chain = incoming
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let value = match chain {
        Some(existing) => format!("{}, {}", existing, peer),
        None => peer.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        out.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

/// Marker inserted by the admission layer into request extensions.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub peer: IpAddr,
    pub request_id: String,
    pub claims: Option<Claims>,
}

/// Terminal service: buffers the body, resolves the route and dispatches.
#[derive(Debug, Clone)]
pub struct ForwardService {
    dispatcher: Arc<Dispatcher>,
    table: Arc<RouteTable>,
    max_body: usize,
}

impl ForwardService {
    pub fn new(dispatcher: Arc<Dispatcher>, table: Arc<RouteTable>, max_body: usize) -> Self {
        Self { dispatcher, table, max_body }
    }

    async fn forward(self, request: Request<Body>) -> Result<UpstreamResponse, GatewayError> {
        let path = request.uri().path().to_string();
        let route = self.table.route_for(&path).ok_or_else(|| GatewayError::NoRoute { path: path.clone() })?;

        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or_else(|| path.clone(), |pq| pq.as_str().to_string());
        let admitted = request.extensions().get::<Admitted>().cloned();
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body)
            .await
            .map_err(|_| GatewayError::PayloadTooLarge { limit: self.max_body })?;

        let (peer, request_id, claims) = match admitted {
            Some(a) => (a.peer, a.request_id, a.claims),
            None => (IpAddr::from([0, 0, 0, 0]), uuid::Uuid::new_v4().to_string(), None),
        };
        let forward = ForwardRequest {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
            claims,
            peer,
            request_id,
        };
        self.dispatcher.dispatch(route, forward).await
    }
}

impl tower::Service<Request<Body>> for ForwardService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            Ok(match this.forward(request).await {
                Ok(response) => response.into_response(),
                Err(err) => err.into_response(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::route::UpstreamUrls;
    use crate::Sleeper;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct NoWait;

    #[async_trait]
    impl Sleeper for NoWait {
        async fn sleep(&self, _duration: Duration) {}
    }

    #[derive(Debug, Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<UpstreamResponse, TransportError>>>,
        seen: Mutex<Vec<UpstreamRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<UpstreamResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), seen: Mutex::default() })
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(UpstreamResponse::new(StatusCode::OK, "default")))
        }
    }

    fn dispatcher(upstream: Arc<Scripted>, retries: usize) -> Dispatcher {
        let policy = RetryPolicy::builder()
            .max_retries(retries)
            .should_retry(AttemptFailure::is_retryable)
            .with_sleeper(NoWait)
            .build()
            .unwrap();
        Dispatcher::new(upstream, policy)
    }

    fn request(path: &str, claims: Option<Claims>) -> ForwardRequest {
        let mut headers = HeaderMap::new();
        headers.insert("username", HeaderValue::from_static("mallory"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        ForwardRequest {
            method: Method::GET,
            path_and_query: path.into(),
            headers,
            body: Bytes::new(),
            claims,
            peer: "10.1.2.3".parse().unwrap(),
            request_id: "req-1".into(),
        }
    }

    fn events_route() -> Route {
        RouteTable::builtin(&UpstreamUrls::default())
            .unwrap()
            .route_for("/api/events")
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn retryable_then_success() {
        let upstream = Scripted::new(vec![
            Err(TransportError::new(TransportKind::ConnectionRefused, "refused")),
            Ok(UpstreamResponse::new(StatusCode::BAD_GATEWAY, "")),
            Ok(UpstreamResponse::new(StatusCode::OK, "ok")),
        ]);
        let response = dispatcher(upstream.clone(), 5)
            .dispatch(&events_route(), request("/api/events/v1?page=2", None))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].url.as_str(), "http://event-service:8080/v1?page=2");
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let upstream = Scripted::new(vec![Ok(UpstreamResponse::new(StatusCode::NOT_FOUND, "nope"))]);
        let response = dispatcher(upstream.clone(), 5)
            .dispatch(&events_route(), request("/api/events/v1/9", None))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_and_non_retryable_transport() {
        let upstream = Scripted::new(vec![Ok(UpstreamResponse::new(StatusCode::SERVICE_UNAVAILABLE, "")); 3]);
        let err = dispatcher(upstream.clone(), 2)
            .dispatch(&events_route(), request("/api/events/v1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RetryExhausted { attempts: 3 }));

        let upstream = Scripted::new(vec![Err(TransportError::new(TransportKind::Other, "bad request"))]);
        let err = dispatcher(upstream.clone(), 2)
            .dispatch(&events_route(), request("/api/events/v1", None))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn declined_backend_failure_is_passed_through() {
        let upstream = Scripted::new(vec![Ok(UpstreamResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy"))]);
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .should_retry(|failure: &AttemptFailure| matches!(failure, AttemptFailure::Transport(_)))
            .with_sleeper(NoWait)
            .build()
            .unwrap();
        let response = Dispatcher::new(upstream.clone(), policy)
            .dispatch(&events_route(), request("/api/events/v1", None))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body, Bytes::from_static(b"busy"));
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identity_headers_replace_client_copies() {
        let upstream = Scripted::new(vec![]);
        let claims = Claims {
            username: "vera".into(),
            sub: None,
            email: Some("vera@example.com".into()),
            role: Role::Vendor,
            exp: 4_000_000_000,
        };
        dispatcher(upstream.clone(), 0)
            .dispatch(&events_route(), request("/api/events/v1", Some(claims)))
            .await
            .unwrap();
        let seen = upstream.seen.lock().unwrap();
        let headers = &seen[0].headers;
        assert_eq!(headers["username"], "vera");
        assert_eq!(headers["email"], "vera@example.com");
        assert_eq!(headers["role"], "vendor");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer abc");
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3");
        assert_eq!(headers["x-request-id"], "req-1");
        assert!(headers.get("x-secret").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        let data: serde_json::Value = serde_json::from_str(headers["userdata"].to_str().unwrap()).unwrap();
        assert_eq!(data["username"], "vera");
    }

    #[tokio::test]
    async fn oversized_user_data_is_omitted() {
        let upstream = Scripted::new(vec![]);
        let claims = Claims { username: "x".repeat(64), sub: None, email: None, role: Role::None, exp: 1 };
        dispatcher(upstream.clone(), 0)
            .max_user_data(32)
            .dispatch(&events_route(), request("/api/events/v1", Some(claims)))
            .await
            .unwrap();
        let seen = upstream.seen.lock().unwrap();
        assert!(seen[0].headers.get("userdata").is_none());
        assert_eq!(seen[0].headers["username"], "x".repeat(64).as_str());
    }

    #[test]
    fn retryability_classes() {
        assert!(TransportKind::Dns.is_retryable());
        assert!(!TransportKind::Other.is_retryable());
        assert!(AttemptFailure::Status(UpstreamResponse::new(StatusCode::TOO_MANY_REQUESTS, "")).is_retryable());
    }
}
