use super::{millis, report, report_store_failure, ClientKey, Decision, FailureMode, THROTTLE};
use crate::clock::Clock;
use crate::error::{GatewayError, Quota};
use crate::store::{gate_key, CounterStore, StoreError};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;

/// Minimum spacing between admitted requests of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub min_interval: Duration,
    /// TTL of the stored timestamp.
    pub window: Duration,
    pub failure_mode: FailureMode,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            window: Duration::from_millis(10_000),
            failure_mode: FailureMode::Open,
        }
    }
}

/// Rejects a client that comes back sooner than `min_interval` after its last admission.
///
/// Only admissions write the timestamp, and a reading older than the stored
/// one counts as zero elapsed time, so the stored instant never moves backwards.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
    telemetry: Telemetry,
}

impl ThrottleGate {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: ThrottleConfig) -> Self {
        Self { store, clock, config, telemetry: Telemetry::default() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub async fn admit(&self, client: &ClientKey) -> Decision {
        let key = gate_key(THROTTLE, client.as_str());
        let decision = match self.check(&key).await {
            Ok(decision) => decision,
            Err(err) => {
                let decision = self.config.failure_mode.on_store_error(THROTTLE, client, err);
                report_store_failure(&self.telemetry, THROTTLE, client, decision.is_proceed()).await;
                decision
            }
        };
        report(&self.telemetry, THROTTLE, client, &decision).await;
        decision
    }

    async fn check(&self, key: &str) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let min_interval = millis(self.config.min_interval);

        if let Some(raw) = self.store.get(key).await? {
            let last: u64 = raw.trim().parse().map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            })?;
            let elapsed = now.saturating_sub(last);
            if elapsed < min_interval {
                let retry_in = Duration::from_millis(min_interval - elapsed);
                tracing::debug!(key, retry_in_ms = min_interval - elapsed, "throttled");
                return Ok(Decision::Reject(GatewayError::QuotaExceeded(Quota::Throttled {
                    retry_in,
                })));
            }
        }

        self.store.set_px(key, &now.to_string(), self.config.window).await?;
        Ok(Decision::Proceed)
    }
}
