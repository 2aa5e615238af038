//! Route table: which backend serves a path, and who may call it.
//!
//! Authorization is evaluated in a fixed order for reproducible answers:
//! open paths first, then token verification, then role restrictions
//! (after the explicit role-exempt list). Matching is by path prefix at
//! segment boundaries plus method equality; `:name` segments in patterns
//! match any single segment.

use crate::auth::{AuthError, Claims, Role, TokenVerifier};
use crate::error::GatewayError;
use axum::http::Method;
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Problems found while loading or validating a route table.
#[derive(Debug, Error)]
pub enum RouteConfigError {
    #[error("route `{name}`: invalid upstream url `{url}`: {reason}")]
    InvalidUpstream { name: String, url: String, reason: String },
    #[error("invalid method `{0}`")]
    InvalidMethod(String),
    #[error("path `{0}` must start with '/'")]
    InvalidPath(String),
    #[error("prefix `{0}` is served by more than one route")]
    DuplicatePrefix(String),
    #[error("restriction on `{0}` must name a concrete role")]
    MissingRole(String),
    #[error("could not read route table: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse route table: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub name: String,
    pub prefix: String,
    /// Prefix removed before forwarding; defaults to `prefix`.
    #[serde(default)]
    pub strip: Option<String>,
    pub upstream: String,
    /// Accepts WebSocket upgrades.
    #[serde(default)]
    pub websocket: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenPathSpec {
    pub path: String,
    pub method: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleRouteSpec {
    pub pattern: String,
    pub methods: Vec<String>,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleExemptSpec {
    pub pattern: String,
    pub methods: Vec<String>,
}

/// Route table as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteTableSpec {
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub open_paths: Vec<OpenPathSpec>,
    #[serde(default)]
    pub role_routes: Vec<RoleRouteSpec>,
    #[serde(default)]
    pub role_exempt: Vec<RoleExemptSpec>,
}

/// Base URLs of the backend services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUrls {
    pub auth: String,
    pub user: String,
    pub event: String,
    pub ticket: String,
    pub reservation: String,
    pub vendor: String,
}

impl Default for UpstreamUrls {
    fn default() -> Self {
        Self {
            auth: "http://auth-service:8080".into(),
            user: "http://user-service:8081".into(),
            event: "http://event-service:8080".into(),
            ticket: "http://ticket-service:8082".into(),
            reservation: "http://reservation-service:8084".into(),
            vendor: "http://vendor-service:8086".into(),
        }
    }
}

fn methods(list: &[&str]) -> Vec<String> {
    list.iter().map(|m| m.to_string()).collect()
}

impl RouteTableSpec {
    /// The ticketing platform's routes.
    pub fn builtin(urls: &UpstreamUrls) -> Self {
        let route = |name: &str, prefix: &str, upstream: &str, websocket: bool| RouteSpec {
            name: name.into(),
            prefix: prefix.into(),
            strip: None,
            upstream: upstream.into(),
            websocket,
        };
        let open = |method: &str, path: &str| OpenPathSpec { path: path.into(), method: method.into() };
        let vendor_only = |pattern: &str, m: &[&str]| RoleRouteSpec {
            pattern: pattern.into(),
            methods: methods(m),
            role: Role::Vendor,
        };
        let exempt = |pattern: &str| RoleExemptSpec { pattern: pattern.into(), methods: methods(&["POST"]) };

        Self {
            routes: vec![
                route("auth", "/api/auth", &urls.auth, false),
                route("users", "/api/users", &urls.user, false),
                route("events", "/api/events", &urls.event, false),
                route("tickets", "/api/tickets", &urls.ticket, true),
                route("reservations", "/api/reservations", &urls.reservation, false),
                route("vendors", "/api/vendors", &urls.vendor, false),
            ],
            open_paths: vec![
                open("GET", "/api/test"),
                open("POST", "/api/auth/login"),
                open("GET", "/api/auth/oauth2-login"),
                open("GET", "/api/auth/callback"),
                open("POST", "/api/users"),
                open("POST", "/api/vendors/v1/authenticate"),
                open("GET", "/api/events/v1"),
            ],
            role_routes: vec![
                vendor_only("/api/events/v1", &["POST"]),
                vendor_only("/api/events/v1/:id/tickets", &["PATCH"]),
                vendor_only("/api/tickets/v1", &["POST", "PUT"]),
                vendor_only("/api/vendors/v1/:id/events", &["POST"]),
                vendor_only("/api/vendors/v1/:id", &["PUT", "DELETE"]),
            ],
            // Buyers reserve seats on events; only event creation is vendor-only.
            role_exempt: vec![
                exempt("/api/events/v1/:id/reserve"),
                exempt("/api/events/v1/:id/complete-reservation"),
                exempt("/api/events/v1/:id/release-reservation"),
            ],
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RouteConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

/// Segment-wise path prefix pattern such as `/api/vendors/v1/:id/events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

fn path_only(path: &str) -> &str {
    path.split_once('?').map_or(path, |(p, _)| p)
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path_only(path).split('/').filter(|s| !s.is_empty())
}

impl FromStr for PathPattern {
    type Err = RouteConfigError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        if !pattern.starts_with('/') {
            return Err(RouteConfigError::InvalidPath(pattern.to_string()));
        }
        let segments = segments(pattern)
            .map(|s| {
                if s.starts_with(':') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Ok(Self { segments })
    }
}

impl PathPattern {
    /// Whether `path` starts with this pattern, on segment boundaries.
    pub fn matches_prefix(&self, path: &str) -> bool {
        let mut parts = segments(path);
        self.segments.iter().all(|seg| match (seg, parts.next()) {
            (_, None) => false,
            (Segment::Param, Some(_)) => true,
            (Segment::Literal(lit), Some(part)) => lit == part,
        })
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

fn parse_method(raw: &str) -> Result<Method, RouteConfigError> {
    Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| RouteConfigError::InvalidMethod(raw.to_string()))
}

fn parse_methods(raw: &[String]) -> Result<Vec<Method>, RouteConfigError> {
    raw.iter().map(|m| parse_method(m)).collect()
}

/// A backend mounted under a gateway prefix.
#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    prefix: PathPattern,
    strip: String,
    upstream: Url,
    websocket: bool,
}

impl Route {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn accepts_websocket(&self) -> bool {
        self.websocket
    }

    /// Remove the gateway prefix exactly once, keeping the query string.
    pub fn rewrite(&self, path_and_query: &str) -> String {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };
        let rest = match path.strip_prefix(self.strip.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        };
        let mut rewritten = if rest.starts_with('/') { rest.to_string() } else { format!("/{}", rest) };
        if let Some(q) = query {
            rewritten.push('?');
            rewritten.push_str(q);
        }
        rewritten
    }

    /// Absolute backend URL for a gateway path.
    pub fn target(&self, path_and_query: &str) -> Result<Url, TargetUrlError> {
        let base = self.upstream.as_str().trim_end_matches('/');
        let url = format!("{}{}", base, self.rewrite(path_and_query));
        Url::parse(&url).map_err(|e| TargetUrlError { url, reason: e.to_string() })
    }
}

/// Rewritten target did not form a valid URL.
#[derive(Debug, Error)]
#[error("invalid target url `{url}`: {reason}")]
pub struct TargetUrlError {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct OpenPath {
    path: PathPattern,
    method: Method,
}

#[derive(Debug, Clone)]
struct RoleRoute {
    pattern: PathPattern,
    methods: Vec<Method>,
    role: Role,
}

#[derive(Debug, Clone)]
struct RoleExempt {
    pattern: PathPattern,
    methods: Vec<Method>,
}

/// What a `(method, path)` pair requires before it may be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No token needed.
    Open,
    /// Any valid token.
    Authenticated,
    /// A valid token carrying this role.
    Restricted(Role),
}

/// Validated, immutable route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    open_paths: Vec<OpenPath>,
    role_routes: Vec<RoleRoute>,
    role_exempt: Vec<RoleExempt>,
}

impl TryFrom<RouteTableSpec> for RouteTable {
    type Error = RouteConfigError;

    fn try_from(spec: RouteTableSpec) -> Result<Self, Self::Error> {
        let mut routes: Vec<Route> = Vec::with_capacity(spec.routes.len());
        for r in spec.routes {
            let prefix: PathPattern = r.prefix.parse()?;
            if routes.iter().any(|existing| existing.prefix == prefix) {
                return Err(RouteConfigError::DuplicatePrefix(r.prefix));
            }
            let upstream = Url::parse(&r.upstream).map_err(|e| RouteConfigError::InvalidUpstream {
                name: r.name.clone(),
                url: r.upstream.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(upstream.scheme(), "http" | "https") {
                return Err(RouteConfigError::InvalidUpstream {
                    name: r.name,
                    url: r.upstream,
                    reason: "scheme must be http or https".into(),
                });
            }
            let strip = r.strip.unwrap_or_else(|| r.prefix.clone());
            if !strip.starts_with('/') {
                return Err(RouteConfigError::InvalidPath(strip));
            }
            routes.push(Route {
                name: r.name,
                prefix,
                strip: strip.trim_end_matches('/').to_string(),
                upstream,
                websocket: r.websocket,
            });
        }

        let open_paths = spec
            .open_paths
            .iter()
            .map(|o| -> Result<OpenPath, RouteConfigError> {
                Ok(OpenPath { path: o.path.parse()?, method: parse_method(&o.method)? })
            })
            .collect::<Result<_, RouteConfigError>>()?;

        let role_routes = spec
            .role_routes
            .iter()
            .map(|r| -> Result<RoleRoute, RouteConfigError> {
                if r.role == Role::None {
                    return Err(RouteConfigError::MissingRole(r.pattern.clone()));
                }
                Ok(RoleRoute {
                    pattern: r.pattern.parse()?,
                    methods: parse_methods(&r.methods)?,
                    role: r.role,
                })
            })
            .collect::<Result<_, RouteConfigError>>()?;

        let role_exempt = spec
            .role_exempt
            .iter()
            .map(|e| -> Result<RoleExempt, RouteConfigError> {
                Ok(RoleExempt { pattern: e.pattern.parse()?, methods: parse_methods(&e.methods)? })
            })
            .collect::<Result<_, RouteConfigError>>()?;

        Ok(Self { routes, open_paths, role_routes, role_exempt })
    }
}

impl RouteTable {
    /// Built-in table pointing at `urls`.
    pub fn builtin(urls: &UpstreamUrls) -> Result<Self, RouteConfigError> {
        RouteTableSpec::builtin(urls).try_into()
    }

    /// Backend serving `path`; the longest matching prefix wins.
    pub fn route_for(&self, path: &str) -> Option<&Route> {
        self.routes.iter().filter(|r| r.prefix.matches_prefix(path)).max_by_key(|r| r.prefix.len())
    }

    /// WebSocket-capable backend serving `path`.
    pub fn websocket_route_for(&self, path: &str) -> Option<&Route> {
        self.route_for(path).filter(|r| r.websocket)
    }

    pub fn is_open(&self, method: &Method, path: &str) -> bool {
        self.open_paths.iter().any(|o| o.method == *method && o.path.matches_prefix(path))
    }

    /// Required role for `(method, path)`, if any.
    pub fn required_role(&self, method: &Method, path: &str) -> Option<Role> {
        let exempt = self
            .role_exempt
            .iter()
            .any(|e| e.methods.contains(method) && e.pattern.matches_prefix(path));
        if exempt {
            return None;
        }
        self.role_routes
            .iter()
            .find(|r| r.methods.contains(method) && r.pattern.matches_prefix(path))
            .map(|r| r.role)
    }

    pub fn access(&self, method: &Method, path: &str) -> Access {
        if self.is_open(method, path) {
            return Access::Open;
        }
        match self.required_role(method, path) {
            Some(role) => Access::Restricted(role),
            None => Access::Authenticated,
        }
    }
}

/// Check verified claims against what `access` demands.
pub fn check_access(
    access: Access,
    identity: Option<Result<Claims, AuthError>>,
) -> Result<Option<Claims>, GatewayError> {
    match access {
        Access::Open => Ok(identity.and_then(Result::ok)),
        Access::Authenticated | Access::Restricted(_) => {
            let claims = identity.unwrap_or(Err(AuthError::MissingToken))?;
            if let Access::Restricted(required) = access {
                if claims.role != required {
                    return Err(GatewayError::Forbidden { required });
                }
            }
            Ok(Some(claims))
        }
    }
}

/// Route authorizer: route table plus the token verifier it consults.
#[derive(Debug, Clone)]
pub struct Authorizer {
    table: std::sync::Arc<RouteTable>,
    verifier: std::sync::Arc<dyn TokenVerifier>,
}

impl Authorizer {
    pub fn new(table: std::sync::Arc<RouteTable>, verifier: std::sync::Arc<dyn TokenVerifier>) -> Self {
        Self { table, verifier }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Decide whether `(method, path)` may proceed with `token`.
    ///
    /// Open paths never touch the token. Returns the caller's claims when a
    /// token was verified.
    pub async fn authorize(
        &self,
        method: &Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<Option<Claims>, GatewayError> {
        let verified = async {
            match token {
                Some(token) => Some(self.verifier.verify(token).await),
                None => None,
            }
        };
        self.authorize_with(method, path, verified).await
    }

    /// [`authorize`](Self::authorize) with the verification supplied by the
    /// caller, for requests whose token may already have been checked.
    /// `identity` is only awaited when the path is protected.
    pub async fn authorize_with<F>(
        &self,
        method: &Method,
        path: &str,
        identity: F,
    ) -> Result<Option<Claims>, GatewayError>
    where
        F: Future<Output = Option<Result<Claims, AuthError>>>,
    {
        let access = self.table.access(method, path);
        let identity = match access {
            Access::Open => None,
            Access::Authenticated | Access::Restricted(_) => identity.await,
        };
        check_access(access, identity)
    }
}
