//! Tower layer that runs the admission pipeline in front of a service.
//!
//! A rejected request is answered here and never reaches the inner service.
//! An admitted one carries an [`Admitted`] extension; its concurrency permit
//! is released once the inner service has produced a response, or when the
//! response future is dropped because the client went away.

use crate::auth::{bearer_from_headers, TokenVerifier};
use crate::dispatch::Admitted;
use crate::pipeline::{AdmissionPipeline, RequestContext};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Where the client address comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerSource {
    /// The TCP peer.
    #[default]
    Socket,
    /// First `X-Forwarded-For` hop, falling back to the TCP peer.
    ForwardedFor,
}

impl PeerSource {
    pub fn resolve(self, headers: &HeaderMap, socket: Option<SocketAddr>) -> IpAddr {
        let socket_ip = socket.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |s| s.ip());
        match self {
            PeerSource::Socket => socket_ip,
            PeerSource::ForwardedFor => headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|hop| hop.trim().parse().ok())
                .unwrap_or(socket_ip),
        }
    }
}

/// Layer wrapping a service with [`AdmissionService`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    pipeline: Arc<AdmissionPipeline>,
    verifier: Arc<dyn TokenVerifier>,
    peer_source: PeerSource,
}

impl AdmissionLayer {
    pub fn new(pipeline: Arc<AdmissionPipeline>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { pipeline, verifier, peer_source: PeerSource::Socket }
    }

    pub fn peer_source(mut self, source: PeerSource) -> Self {
        self.peer_source = source;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            pipeline: self.pipeline.clone(),
            verifier: self.verifier.clone(),
            peer_source: self.peer_source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: Arc<AdmissionPipeline>,
    verifier: Arc<dyn TokenVerifier>,
    peer_source: PeerSource,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let socket = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
        let peer = self.peer_source.resolve(request.headers(), socket);
        let ctx = RequestContext::new(
            peer,
            request.method().clone(),
            request.uri().path(),
            bearer_from_headers(request.headers()),
            self.verifier.clone(),
        );
        let pipeline = self.pipeline.clone();

        Box::pin(async move {
            let mut ctx = match pipeline.admit(ctx).await {
                Ok(ctx) => ctx,
                Err(err) => return Ok(err.into_response()),
            };
            let permit = ctx.take_permit();
            request.extensions_mut().insert(Admitted {
                peer: ctx.peer(),
                request_id: ctx.request_id().to_string(),
                claims: ctx.claims().cloned(),
            });

            let response = inner.call(request).await;
            if let Some(permit) = permit {
                permit.release().await;
            }
            response
        })
    }
}
