//! Explicit admission pipeline.
//!
//! Every HTTP request runs the same fixed sequence of stages: throttle,
//! concurrency, rate, authorize. Each stage looks at the shared
//! [`RequestContext`] and answers [`Decision::Proceed`] or
//! [`Decision::Reject`]; the first rejection short-circuits the rest and no
//! backend is contacted.

use crate::auth::{AuthError, Claims, TokenVerifier};
use crate::error::GatewayError;
use crate::gate::{
    ClientKey, ConcurrencyGate, ConcurrencyPermit, Decision, KeySource, RateGate, ThrottleGate,
};
use crate::route::Authorizer;
use async_trait::async_trait;
use axum::http::Method;
use std::net::IpAddr;
use std::sync::Arc;

/// Per-request state threaded through the admission stages.
#[derive(Debug)]
pub struct RequestContext {
    peer: IpAddr,
    method: Method,
    path: String,
    request_id: String,
    bearer: Result<String, AuthError>,
    verifier: Arc<dyn TokenVerifier>,
    identity: Option<Result<Claims, AuthError>>,
    claims: Option<Claims>,
    permit: Option<ConcurrencyPermit>,
}

impl RequestContext {
    pub fn new(
        peer: IpAddr,
        method: Method,
        path: impl Into<String>,
        bearer: Result<&str, AuthError>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            peer,
            method,
            path: path.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            bearer: bearer.map(str::to_owned),
            verifier,
            identity: None,
            claims: None,
            permit: None,
        }
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Claims attached by the authorize stage.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn take_permit(&mut self) -> Option<ConcurrencyPermit> {
        self.permit.take()
    }

    /// Verify the presented token at most once per request.
    ///
    /// `None` when no token was presented at all.
    pub async fn identity(&mut self) -> Option<Result<Claims, AuthError>> {
        if self.identity.is_none() {
            self.identity = match &self.bearer {
                Err(AuthError::MissingToken) => return None,
                Err(other) => Some(Err(*other)),
                Ok(token) => Some(self.verifier.verify(token).await),
            };
        }
        self.identity.clone()
    }

    /// Partition key for a gate reading from `source`.
    pub async fn client_key(&mut self, source: KeySource) -> ClientKey {
        if source == KeySource::Identity {
            if let Some(Ok(claims)) = self.identity().await {
                if !claims.subject().is_empty() {
                    return ClientKey::new(claims.subject());
                }
            }
        }
        ClientKey::from(self.peer)
    }
}

/// One step of the admission pipeline.
#[async_trait]
pub trait AdmissionStage: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    async fn evaluate(&self, ctx: &mut RequestContext) -> Decision;
}

#[derive(Debug, Clone)]
pub struct ThrottleStage {
    pub gate: ThrottleGate,
    pub key_source: KeySource,
}

#[async_trait]
impl AdmissionStage for ThrottleStage {
    fn name(&self) -> &'static str {
        crate::gate::THROTTLE
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Decision {
        let client = ctx.client_key(self.key_source).await;
        self.gate.admit(&client).await
    }
}

/// Takes a concurrency slot and parks the permit in the context.
#[derive(Debug, Clone)]
pub struct ConcurrencyStage {
    pub gate: ConcurrencyGate,
    pub key_source: KeySource,
}

#[async_trait]
impl AdmissionStage for ConcurrencyStage {
    fn name(&self) -> &'static str {
        crate::gate::CONCURRENCY
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Decision {
        let client = ctx.client_key(self.key_source).await;
        match self.gate.enter(&client).await {
            Ok(permit) => {
                ctx.permit = Some(permit);
                Decision::Proceed
            }
            Err(err) => Decision::Reject(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateStage {
    pub gate: RateGate,
    pub key_source: KeySource,
}

#[async_trait]
impl AdmissionStage for RateStage {
    fn name(&self) -> &'static str {
        crate::gate::RATE
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Decision {
        let client = ctx.client_key(self.key_source).await;
        self.gate.admit(&client).await
    }
}

/// Open-path check, then token, then role.
///
/// The token is verified through the context, so a rate stage keyed by
/// identity and this stage share one verification.
#[derive(Debug, Clone)]
pub struct AuthorizeStage {
    pub authorizer: Authorizer,
}

#[async_trait]
impl AdmissionStage for AuthorizeStage {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn evaluate(&self, ctx: &mut RequestContext) -> Decision {
        let (method, path) = (ctx.method.clone(), ctx.path.clone());
        match self.authorizer.authorize_with(&method, &path, ctx.identity()).await {
            Ok(claims) => {
                ctx.claims = claims;
                Decision::Proceed
            }
            Err(err) => {
                tracing::info!(
                    client = %ctx.peer,
                    method = %ctx.method,
                    path = %ctx.path,
                    error = %err,
                    "request not authorized"
                );
                Decision::Reject(err)
            }
        }
    }
}

/// Ordered list of stages run for every request.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPipeline {
    stages: Vec<Arc<dyn AdmissionStage>>,
}

impl AdmissionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages run in insertion order.
    pub fn stage<S: AdmissionStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// The gateway's standard order: throttle, concurrency, rate, authorize.
    pub fn standard(
        throttle: ThrottleStage,
        concurrency: ConcurrencyStage,
        rate: RateStage,
        authorize: AuthorizeStage,
    ) -> Self {
        Self::new().stage(throttle).stage(concurrency).stage(rate).stage(authorize)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order.
    ///
    /// On success the context comes back holding the concurrency permit,
    /// which the caller must release once the response is complete. On
    /// rejection any permit already taken is released before returning.
    pub async fn admit(&self, mut ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        for stage in &self.stages {
            match stage.evaluate(&mut ctx).await {
                Decision::Proceed => {}
                Decision::Reject(err) => {
                    tracing::debug!(stage = stage.name(), path = %ctx.path, error = %err, "admission rejected");
                    if let Some(permit) = ctx.take_permit() {
                        permit.release().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(ctx)
    }
}
