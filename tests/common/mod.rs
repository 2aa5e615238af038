#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tixgate::dispatch::{TransportError, Upstream, UpstreamRequest, UpstreamResponse};
use tixgate::store::{CounterStore, StoreError};
use tixgate::telemetry::{MemorySink, Telemetry};
use tixgate::ws::{TcpConnector, TunnelConnector};
use tixgate::{Gateway, GatewayConfig, GatewayParts, InMemoryCounterStore, JwtVerifier, ManualClock, Sleeper};

pub const SECRET: &str = "integration-secret";

/// Signed HS256 token valid for an hour.
pub fn token(username: &str, role: &str) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let claims = json!({ "username": username, "email": format!("{}@example.com", username), "role": role, "exp": exp });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

/// Store whose every command fails, as if the server were down.
#[derive(Debug, Default)]
pub struct DownStore;

fn down() -> StoreError {
    StoreError::Connection("connection refused".into())
}

#[async_trait]
impl CounterStore for DownStore {
    async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
        Err(down())
    }
    async fn decr(&self, _key: &str) -> Result<i64, StoreError> {
        Err(down())
    }
    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(down())
    }
    async fn pexpire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }
    async fn set_px(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(down())
    }
    async fn zadd(&self, _key: &str, _score: i64, _member: &str) -> Result<(), StoreError> {
        Err(down())
    }
    async fn zremrangebyscore(&self, _key: &str, _min: i64, _max: i64) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn zcard(&self, _key: &str) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
}

/// Backoff sleeper that records each delay and returns at once.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Upstream that replays scripted answers, then answers 200 `ok`.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    replies: Mutex<VecDeque<Result<UpstreamResponse, TransportError>>>,
    seen: Mutex<Vec<UpstreamRequest>>,
    hang: bool,
}

impl ScriptedUpstream {
    pub fn new(replies: Vec<Result<UpstreamResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()), ..Self::default() })
    }

    /// Records each request and never answers.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self { hang: true, ..Self::default() })
    }

    pub fn seen(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        self.seen.lock().unwrap().push(request);
        if self.hang {
            return std::future::pending().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(UpstreamResponse::new(StatusCode::OK, "ok")))
    }
}

/// Everything a test needs to poke at a gateway.
pub struct Harness {
    pub gateway: Gateway,
    pub store: Arc<dyn CounterStore>,
    pub clock: ManualClock,
    pub upstream: Arc<ScriptedUpstream>,
    pub sleeper: TrackingSleeper,
    pub events: MemorySink,
}

pub fn config() -> GatewayConfig {
    let mut config = GatewayConfig::new(SECRET);
    config.instance_name = "gw-test".into();
    config
}

/// Gateway over an in-memory store driven by a manual clock.
pub fn harness(config: GatewayConfig, upstream: Arc<ScriptedUpstream>) -> Harness {
    let clock = ManualClock::default();
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
    assemble(config, store, clock, upstream, Arc::new(TcpConnector::default()))
}

/// Gateway over a store that is down.
pub fn harness_down(config: GatewayConfig, upstream: Arc<ScriptedUpstream>) -> Harness {
    assemble(config, Arc::new(DownStore), ManualClock::default(), upstream, Arc::new(TcpConnector::default()))
}

pub fn assemble(
    config: GatewayConfig,
    store: Arc<dyn CounterStore>,
    clock: ManualClock,
    upstream: Arc<ScriptedUpstream>,
    connector: Arc<dyn TunnelConnector>,
) -> Harness {
    let sleeper = TrackingSleeper::default();
    let sink = MemorySink::new();
    let parts = GatewayParts {
        config,
        store: store.clone(),
        clock: Arc::new(clock.clone()),
        verifier: Arc::new(JwtVerifier::hs256(SECRET.as_bytes())),
        upstream: upstream.clone(),
        connector,
        sleeper: Arc::new(sleeper.clone()) as Arc<dyn Sleeper>,
        telemetry: Telemetry::new(sink.clone()),
    };
    Harness {
        gateway: Gateway::new(parts).unwrap(),
        store,
        clock,
        upstream,
        sleeper,
        events: sink,
    }
}

/// Build a request arriving from `peer`, with an optional bearer token.
pub fn request(method: &str, path: &str, token: Option<&str>, peer: &str) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn text_body(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
