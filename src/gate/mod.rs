//! Admission gates: throttling, concurrency capping and sliding-window rate limiting.
//!
//! Each gate partitions its state by [`ClientKey`] inside the shared
//! [`CounterStore`](crate::store::CounterStore) and answers with a
//! [`Decision`]. What happens when the store itself fails is an explicit
//! per-gate [`FailureMode`].

use crate::error::GatewayError;
use crate::store::StoreError;
use crate::telemetry::{GateEvent, GatewayEvent, Telemetry};
use serde::Deserialize;
use std::fmt;

mod concurrency;
mod rate;
mod throttle;

pub use concurrency::{ConcurrencyConfig, ConcurrencyGate, ConcurrencyPermit};
pub use rate::{RateConfig, RateGate};
pub use throttle::{ThrottleConfig, ThrottleGate};

/// Store namespace of the throttling gate.
pub const THROTTLE: &str = "throttle";
/// Store namespace of the concurrency gate.
pub const CONCURRENCY: &str = "concurrency";
/// Store namespace of the sliding-window rate gate.
pub const RATE: &str = "rate_limiter";

/// Outcome of a single gate evaluation.
#[derive(Debug)]
pub enum Decision {
    Proceed,
    Reject(GatewayError),
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed)
    }
}

/// What a gate does when the counter store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through and log.
    Open,
    /// Reject the request with a 500-class error.
    Closed,
}

impl FailureMode {
    pub(crate) fn on_store_error(
        self,
        gate: &'static str,
        client: &ClientKey,
        err: StoreError,
    ) -> Decision {
        match self {
            FailureMode::Open => {
                tracing::warn!(gate, client = %client, error = %err, "store unavailable, failing open");
                Decision::Proceed
            }
            FailureMode::Closed => {
                tracing::error!(gate, client = %client, error = %err, "store unavailable, failing closed");
                Decision::Reject(GatewayError::StoreUnavailable { gate, source: err })
            }
        }
    }
}

/// Where a gate takes its partition key from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Client network address.
    Address,
    /// Authenticated username, falling back to the address for anonymous requests.
    Identity,
}

/// Partition key for per-client gate state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<std::net::IpAddr> for ClientKey {
    fn from(ip: std::net::IpAddr) -> Self {
        Self(ip.to_string())
    }
}

/// Publish the outcome of a gate evaluation.
pub(crate) async fn report(
    telemetry: &Telemetry,
    gate: &'static str,
    client: &ClientKey,
    decision: &Decision,
) {
    let client = client.to_string();
    let event = match decision {
        Decision::Proceed => GateEvent::Admitted { gate, client },
        Decision::Reject(_) => GateEvent::Rejected { gate, client },
    };
    telemetry.emit(GatewayEvent::Gate(event)).await;
}

pub(crate) async fn report_store_failure(
    telemetry: &Telemetry,
    gate: &'static str,
    client: &ClientKey,
    failed_open: bool,
) {
    let event = GateEvent::StoreFailure { gate, client: client.to_string(), failed_open };
    telemetry.emit(GatewayEvent::Gate(event)).await;
}

pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
