//! HTTP surface and connection handling.
//!
//! One TCP listener serves everything. Every request head is read up front,
//! including later ones on a kept-alive connection: WebSocket upgrades for a
//! streaming route go to the [`UpgradeAuthenticator`], everything else is
//! replayed into hyper one request at a time and served by the axum router.

use crate::auth::{JwtVerifier, TokenVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::dispatch::{AttemptFailure, Dispatcher, ForwardService, ReqwestUpstream, TransportError, Upstream};
use crate::gate::{ConcurrencyGate, RateGate, ThrottleGate};
use crate::middleware::{AdmissionLayer, PeerSource};
use crate::pipeline::{AdmissionPipeline, AuthorizeStage, ConcurrencyStage, RateStage, ThrottleStage};
use crate::retry::{BuildError, RetryPolicy};
use crate::route::{Authorizer, RouteConfigError};
use crate::store::CounterStore;
use crate::telemetry::Telemetry;
use crate::ws::{read_head, RequestHead, TcpConnector, TunnelConnector, UpgradeAuthenticator, MAX_HEAD_BYTES};
use crate::{Sleeper, TokioSleeper};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONNECTION;
use axum::http::{HeaderValue, StatusCode, Version};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Buf, Bytes, BytesMut};
use futures::future::{self, FutureExt};
use hyper_util::rt::{TokioIo, TokioTimer};
use pin_project::pin_project;
use serde_json::json;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Routes(#[from] RouteConfigError),
    #[error("invalid retry settings: {0}")]
    Retry(#[from] BuildError),
    #[error("could not build upstream client: {0}")]
    Client(#[from] TransportError),
    #[error("instance name is not a valid header value")]
    InstanceName,
}

/// Collaborators a [`Gateway`] is assembled from.
#[derive(Debug, Clone)]
pub struct GatewayParts {
    pub config: GatewayConfig,
    pub store: Arc<dyn CounterStore>,
    pub clock: Arc<dyn Clock>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub upstream: Arc<dyn Upstream>,
    pub connector: Arc<dyn TunnelConnector>,
    pub sleeper: Arc<dyn Sleeper>,
    pub telemetry: Telemetry,
}

impl GatewayParts {
    /// Real clock, HS256 verifier, reqwest client and TCP tunnels.
    pub fn production(config: GatewayConfig, store: Arc<dyn CounterStore>) -> Result<Self, StartupError> {
        let upstream = ReqwestUpstream::new(config.upstream_timeout)?;
        Ok(Self {
            verifier: Arc::new(JwtVerifier::hs256(config.jwt_secret.as_bytes())),
            upstream: Arc::new(upstream),
            connector: Arc::new(TcpConnector { timeout: config.upstream_timeout }),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::default(),
            config,
            store,
        })
    }
}

/// A fully wired gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    router: Router,
    upgrade: UpgradeAuthenticator,
    peer_source: PeerSource,
    header_read_timeout: Duration,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Result<Self, StartupError> {
        let GatewayParts { config, store, clock, verifier, upstream, connector, sleeper, telemetry } = parts;
        let table = Arc::new(config.route_table()?);
        let peer_source = if config.trust_forwarded_for { PeerSource::ForwardedFor } else { PeerSource::Socket };

        let pipeline = AdmissionPipeline::standard(
            ThrottleStage {
                gate: ThrottleGate::new(store.clone(), clock.clone(), config.throttle)
                    .with_telemetry(telemetry.clone()),
                key_source: config.key_sources.throttle,
            },
            ConcurrencyStage {
                gate: ConcurrencyGate::new(store.clone(), config.concurrency).with_telemetry(telemetry.clone()),
                key_source: config.key_sources.concurrency,
            },
            RateStage {
                gate: RateGate::new(store.clone(), clock, config.rate).with_telemetry(telemetry.clone()),
                key_source: config.key_sources.rate,
            },
            AuthorizeStage { authorizer: Authorizer::new(table.clone(), verifier.clone()) },
        );

        let policy = RetryPolicy::builder()
            .max_retries(config.retry.max_retries)
            .initial_delay(config.retry.initial_delay)
            .max_delay(config.retry.max_delay)
            .should_retry(AttemptFailure::is_retryable)
            .with_shared_sleeper(sleeper)
            .build()?;
        let dispatcher = Dispatcher::new(upstream, policy)
            .max_user_data(config.max_user_data_bytes)
            .with_telemetry(telemetry.clone());

        let upgrade = UpgradeAuthenticator::new(table.clone(), verifier.clone(), connector)
            .max_user_data(config.max_user_data_bytes)
            .with_telemetry(telemetry);

        let instance =
            HeaderValue::from_str(&config.instance_name).map_err(|_| StartupError::InstanceName)?;
        let admission = AdmissionLayer::new(Arc::new(pipeline), verifier).peer_source(peer_source);
        let forward = ForwardService::new(Arc::new(dispatcher), table, config.max_body_bytes);

        let router = Router::new()
            .route("/api/test", get(test_endpoint))
            .fallback_service(forward)
            .layer(admission)
            .route("/debug/store-keys", get(store_keys).with_state(store))
            .layer(axum::middleware::from_fn_with_state(instance, add_instance_header));

        Ok(Self { router, upgrade, peer_source, header_read_timeout: config.header_read_timeout })
    }

    /// The HTTP router, for serving or driving directly in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn upgrade(&self) -> &UpgradeAuthenticator {
        &self.upgrade
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let mut socket = Prefixed::new(Bytes::new(), stream);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let read = tokio::select! {
                read = read_head(&mut socket, MAX_HEAD_BYTES, self.header_read_timeout) => read,
                _ = shutdown.changed() => return,
            };
            let (buf, end) = match read {
                Ok(read) => read,
                Err(err) => {
                    tracing::debug!(client = %peer, error = %err, "closing connection between requests");
                    return;
                }
            };
            let (rest, stream) = socket.into_parts();

            if let Ok(head) = RequestHead::parse(&buf[..end]) {
                if self.upgrade.accepts(&head) {
                    let client = self.peer_source.resolve(&head.header_map(), Some(peer));
                    let io = Prefixed::new(rest, stream);
                    tokio::select! {
                        outcome = self.upgrade.handle(io, head, &buf[end..], client) => {
                            tracing::debug!(client = %client, ?outcome, "upgrade finished");
                        }
                        _ = shutdown.changed() => {
                            tracing::debug!(client = %client, "closing tunnel for shutdown");
                        }
                    }
                    return;
                }
            }

            let replay = Prefixed::new(joined(&buf, &rest), stream);
            match self.serve_request(replay, peer, &mut shutdown).await {
                Some(next) => socket = next,
                None => return,
            }
        }
    }

    /// Serve a single request through hyper. Keep-alive is driven here rather
    /// than by hyper, so the next head on the socket is inspected for an
    /// upgrade too. Returns the socket if it can carry another request.
    async fn serve_request(
        &self,
        socket: Prefixed<TcpStream>,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Prefixed<TcpStream>> {
        let reusable = Arc::new(AtomicBool::new(true));
        let router = self.router.clone();
        let flag = reusable.clone();
        let service = hyper::service::service_fn(move |mut request: hyper::Request<hyper::body::Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            // An unread body would be taken for the next head.
            let closing = closes_after(&request);
            if closing {
                flag.store(false, Ordering::Relaxed);
            }
            router
                .clone()
                .oneshot(request)
                .map(move |result| {
                    result.map(|mut response| {
                        if closing {
                            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
                        }
                        response
                    })
                })
                .boxed()
        });

        let mut conn = hyper::server::conn::http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .keep_alive(false)
            .serve_connection(TokioIo::new(socket), service);

        let finished = tokio::select! {
            result = future::poll_fn(|cx| conn.poll_without_shutdown(cx)) => Some(result),
            _ = shutdown.changed() => None,
        };
        match finished {
            Some(Ok(())) if reusable.load(Ordering::Relaxed) => {
                let parts = conn.into_parts();
                let (rest, stream) = parts.io.into_inner().into_parts();
                Some(Prefixed::new(joined(&parts.read_buf, &rest), stream))
            }
            Some(Ok(())) => None,
            Some(Err(err)) => {
                tracing::debug!(client = %peer, error = %err, "connection closed with error");
                None
            }
            None => {
                Pin::new(&mut conn).graceful_shutdown();
                if let Err(err) = future::poll_fn(|cx| conn.poll_without_shutdown(cx)).await {
                    tracing::debug!(client = %peer, error = %err, "connection closed with error");
                }
                None
            }
        }
    }
}

fn closes_after<B: hyper::body::Body>(request: &hyper::Request<B>) -> bool {
    let close_requested = request
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    close_requested || request.version() == Version::HTTP_10 || !request.body().is_end_stream()
}

fn joined(head: &[u8], tail: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(head.len() + tail.len());
    out.extend_from_slice(head);
    out.extend_from_slice(tail);
    out.freeze()
}

async fn test_endpoint() -> Json<serde_json::Value> {
    Json(json!({ "message": "Success! You have not hit the rate limit." }))
}

async fn store_keys(State(store): State<Arc<dyn CounterStore>>) -> Response {
    match store.keys("*").await {
        Ok(keys) => Json(json!({ "keys": keys })).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "could not list store keys");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Failed to fetch store keys" })))
                .into_response()
        }
    }
}

async fn add_instance_header(State(instance): State<HeaderValue>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-gateway-instance", instance);
    response
}

/// Accept connections until `shutdown` resolves, then drain in-flight HTTP
/// requests. Open tunnels are closed.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let gateway = Arc::new(gateway);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(gateway.clone().serve_connection(stream, peer, stop_rx.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            },
        }
        while connections.try_join_next().is_some() {}
    }

    tracing::info!(in_flight = connections.len(), "shutting down");
    let _ = stop_tx.send(true);
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Socket with already-consumed bytes replayed in front of it.
#[pin_project]
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Bytes,
    #[pin]
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Unread prefix bytes and the wrapped socket.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead> AsyncRead for Prefixed<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Prefixed<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
