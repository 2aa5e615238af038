use super::{millis, report, report_store_failure, ClientKey, Decision, FailureMode, RATE};
use crate::clock::Clock;
use crate::error::{GatewayError, Quota};
use crate::store::{gate_key, CounterStore, StoreError};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;

/// Sliding-window budget per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub window: Duration,
    pub max_requests: u32,
    pub failure_mode: FailureMode,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(60_000), max_requests: 5, failure_mode: FailureMode::Closed }
    }
}

/// Sliding-window limiter over a per-client sorted set of admission markers.
///
/// Markers older than the window are purged lazily on each check. The purge,
/// count and insert are separate store calls; two racing requests may both
/// see room for one more near the limit.
#[derive(Debug, Clone)]
pub struct RateGate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateConfig,
    telemetry: Telemetry,
}

impl RateGate {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: RateConfig) -> Self {
        Self { store, clock, config, telemetry: Telemetry::default() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    pub async fn admit(&self, client: &ClientKey) -> Decision {
        let key = gate_key(RATE, client.as_str());
        let decision = match self.check(&key).await {
            Ok(decision) => decision,
            Err(err) => {
                let decision = self.config.failure_mode.on_store_error(RATE, client, err);
                report_store_failure(&self.telemetry, RATE, client, decision.is_proceed()).await;
                decision
            }
        };
        report(&self.telemetry, RATE, client, &decision).await;
        decision
    }

    async fn check(&self, key: &str) -> Result<Decision, StoreError> {
        let now = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        let window = i64::try_from(millis(self.config.window)).unwrap_or(i64::MAX);
        let window_start = now.saturating_sub(window);

        // Markers scored exactly at the window start still count.
        self.store.zremrangebyscore(key, 0, window_start - 1).await?;
        let count = self.store.zcard(key).await?;

        if count >= u64::from(self.config.max_requests) {
            tracing::info!(key, count, limit = self.config.max_requests, "rate limit reached");
            return Ok(Decision::Reject(GatewayError::QuotaExceeded(Quota::Rate {
                limit: self.config.max_requests,
                window: self.config.window,
            })));
        }

        let member = format!("{}-{:016x}", now, rand::random::<u64>());
        self.store.zadd(key, now, &member).await?;
        self.store.pexpire(key, self.config.window).await?;
        Ok(Decision::Proceed)
    }
}
