//! Error types for the gateway
use crate::auth::{AuthError, Role};
use crate::dispatch::TransportError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Cap the number of stored failures inside `RetryError::Exhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Clone)]
pub enum RetryError<E> {
    /// The predicate classified the failure as non-retryable; returned after one attempt.
    Aborted(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: usize, failures: Arc<Vec<E>> },
}

impl<E> RetryError<E> {
    /// Build `Exhausted`, keeping only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        RetryError::Exhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The failure that ended the loop.
    pub fn last(&self) -> Option<&E> {
        match self {
            Self::Aborted(e) => Some(e),
            Self::Exhausted { failures, .. } => failures.last(),
        }
    }

    /// Recorded failures of an exhausted loop.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::Exhausted { failures, .. } => Some(failures.as_slice()),
            Self::Aborted(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(e) => write!(f, "non-retryable failure: {}", e),
            Self::Exhausted { attempts, failures } => {
                let truncated_note = if failures.len() < *attempts {
                    format!(" (recorded last {} failures)", failures.len())
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    ),
                    None => write!(f, "retry exhausted after {} attempts{}", attempts, truncated_note),
                }
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|e| e as &dyn std::error::Error)
    }
}

/// Why an admission gate turned a request away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quota {
    /// Minimum interval not yet elapsed since the last admission.
    Throttled { retry_in: Duration },
    /// Too many requests already in flight for this client.
    Concurrency { active: i64, max: u32 },
    /// Sliding-window budget spent.
    Rate { limit: u32, window: Duration },
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Throttled { retry_in } => write!(f, "throttled, retry in {}ms", retry_in.as_millis()),
            Quota::Concurrency { active, max } => {
                write!(f, "{} concurrent requests (max {})", active, max)
            }
            Quota::Rate { limit, window } => {
                write!(f, "{} requests per {}ms exceeded", limit, window.as_millis())
            }
        }
    }
}

/// Every failure the gateway can surface to a client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(Quota),
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("role `{required}` required")]
    Forbidden { required: Role },
    #[error("no route for {path}")]
    NoRoute { path: String },
    #[error("{gate} gate store unavailable: {source}")]
    StoreUnavailable {
        gate: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("upstream transport failure: {0}")]
    BadGateway(#[source] TransportError),
    #[error("upstream unavailable after {attempts} attempts")]
    RetryExhausted { attempts: usize },
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            Self::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::RetryExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Client-facing message. Never includes internal details.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::QuotaExceeded(Quota::Throttled { .. }) => {
                "Too many requests - you are being throttled."
            }
            Self::QuotaExceeded(Quota::Concurrency { .. }) => "Too many concurrent requests",
            Self::QuotaExceeded(Quota::Rate { .. }) => "Too many requests. Rate limit reached",
            Self::Unauthenticated(_) => "Unauthorized",
            Self::Forbidden { .. } => "Forbidden: insufficient role",
            Self::NoRoute { .. } => "Not found",
            Self::StoreUnavailable { .. } => "Internal server error",
            Self::BadGateway(_) => "Bad gateway",
            Self::RetryExhausted { .. } => "Service unavailable",
            Self::PayloadTooLarge { .. } => "Payload too large",
        }
    }

    /// Milliseconds the client should wait, for throttle rejections.
    pub fn retry_in(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded(Quota::Throttled { retry_in }) => {
                Some(u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self.retry_in() {
            Some(ms) => json!({ "error": self.user_message(), "retryIn": ms }),
            None => json!({ "error": self.user_message() }),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_keeps_most_recent_failures() {
        let failures: Vec<u32> = (0..25).collect();
        let err = RetryError::exhausted(25, failures);
        let kept = err.failures().expect("exhausted");
        assert_eq!(kept.len(), MAX_RETRY_FAILURES);
        assert_eq!(kept.first(), Some(&15));
        assert_eq!(err.last(), Some(&24));
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        let throttled = GatewayError::QuotaExceeded(Quota::Throttled {
            retry_in: Duration::from_millis(400),
        });
        assert_eq!(throttled.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(throttled.retry_in(), Some(400));
        assert_eq!(
            GatewayError::Unauthenticated(AuthError::MissingToken).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden { required: Role::Vendor }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RetryExhausted { attempts: 6 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn auth_reasons_are_indistinguishable_to_clients() {
        let expired = GatewayError::Unauthenticated(AuthError::ExpiredToken);
        let forged = GatewayError::Unauthenticated(AuthError::InvalidSignature);
        assert_eq!(expired.user_message(), forged.user_message());
        assert_eq!(expired.status_code(), forged.status_code());
    }
}
