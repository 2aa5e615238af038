//! Telemetry for gateway decisions.
//!
//! Gates, the dispatcher and the upgrade authenticator describe what they did
//! as [`GatewayEvent`]s. Events flow into a sink, which is any
//! `tower::Service<GatewayEvent>`, so sinks compose with ordinary tower
//! combinators. Emission is best-effort: a failing or slow sink never
//! changes the outcome of a request.
//!
//! ```rust
//! use tixgate::telemetry::{GatewayEvent, GateEvent, MemorySink, Telemetry};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let sink = MemorySink::new();
//! let telemetry = Telemetry::new(sink.clone());
//! telemetry
//!     .emit(GatewayEvent::Gate(GateEvent::Rejected {
//!         gate: "throttle",
//!         client: "10.0.0.1".into(),
//!     }))
//!     .await;
//! assert_eq!(sink.len(), 1);
//! # });
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::Service;

/// Future type shared by the built-in sinks.
pub type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Events emitted while admitting, forwarding or tunnelling a request.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Gate(GateEvent),
    Retry(RetryEvent),
    Upgrade(UpgradeEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// A gate let the request through.
    Admitted { gate: &'static str, client: String },
    /// A gate turned the request away.
    Rejected { gate: &'static str, client: String },
    /// The store failed and the gate applied its failure mode.
    StoreFailure { gate: &'static str, client: String, failed_open: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// An upstream attempt failed; `retryable` says whether another may follow.
    AttemptFailed { target: String, attempt: usize, retryable: bool },
    /// No attempts left.
    Exhausted { target: String, attempts: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeEvent {
    Accepted { route: String, username: String },
    Rejected { route: String, status: u16 },
    TunnelFailed { route: String },
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::Gate(GateEvent::Admitted { gate, client }) => {
                write!(f, "Gate::Admitted(gate={}, client={})", gate, client)
            }
            GatewayEvent::Gate(GateEvent::Rejected { gate, client }) => {
                write!(f, "Gate::Rejected(gate={}, client={})", gate, client)
            }
            GatewayEvent::Gate(GateEvent::StoreFailure { gate, client, failed_open }) => write!(
                f,
                "Gate::StoreFailure(gate={}, client={}, failed_open={})",
                gate, client, failed_open
            ),
            GatewayEvent::Retry(RetryEvent::AttemptFailed { target, attempt, retryable }) => write!(
                f,
                "Retry::AttemptFailed(target={}, attempt={}, retryable={})",
                target, attempt, retryable
            ),
            GatewayEvent::Retry(RetryEvent::Exhausted { target, attempts }) => {
                write!(f, "Retry::Exhausted(target={}, attempts={})", target, attempts)
            }
            GatewayEvent::Upgrade(UpgradeEvent::Accepted { route, username }) => {
                write!(f, "Upgrade::Accepted(route={}, user={})", route, username)
            }
            GatewayEvent::Upgrade(UpgradeEvent::Rejected { route, status }) => {
                write!(f, "Upgrade::Rejected(route={}, status={})", route, status)
            }
            GatewayEvent::Upgrade(UpgradeEvent::TunnelFailed { route }) => {
                write!(f, "Upgrade::TunnelFailed(route={})", route)
            }
        }
    }
}

/// Sink that discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GatewayEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GatewayEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// Sink that logs each event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GatewayEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        tracing::info!(event = %event, "gateway_event");
        Box::pin(async { Ok(()) })
    }
}

/// Bounded in-memory sink; the oldest events are evicted first.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<GatewayEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Default cap: 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GatewayEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GatewayEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

/// Send one event, ignoring readiness and call failures.
pub async fn emit_best_effort<S>(sink: S, event: GatewayEvent)
where
    S: Service<GatewayEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Type-erased, cheaply cloneable handle to the configured sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<GatewayEvent, (), Infallible>>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: Service<GatewayEvent, Response = (), Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(sink))) }
    }

    pub async fn emit(&self, event: GatewayEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event).await;
    }
}
