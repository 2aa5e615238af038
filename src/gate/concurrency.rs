use super::{report_store_failure, ClientKey, FailureMode, CONCURRENCY};
use crate::error::{GatewayError, Quota};
use crate::store::{gate_key, CounterStore};
use crate::telemetry::{GateEvent, GatewayEvent, Telemetry};
use std::sync::Arc;
use std::time::Duration;

/// Cap on simultaneously in-flight requests per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub max_concurrent: u32,
    /// Safety TTL set when a client's counter is created, so a crashed
    /// handler cannot pin a slot forever.
    pub ttl: Duration,
    pub failure_mode: FailureMode,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 3, ttl: Duration::from_millis(15_000), failure_mode: FailureMode::Open }
    }
}

/// Counts in-flight requests per client in the shared store.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    store: Arc<dyn CounterStore>,
    config: ConcurrencyConfig,
    telemetry: Telemetry,
}

impl ConcurrencyGate {
    pub fn new(store: Arc<dyn CounterStore>, config: ConcurrencyConfig) -> Self {
        Self { store, config, telemetry: Telemetry::default() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Take a slot for `client`.
    ///
    /// The returned permit must reach [`exit`](Self::exit) (or be dropped) on
    /// every completion path; it decrements the counter exactly once.
    pub async fn enter(&self, client: &ClientKey) -> Result<ConcurrencyPermit, GatewayError> {
        let outcome = self.try_enter(client).await;
        let client = client.to_string();
        let event = match &outcome {
            Ok(_) => GateEvent::Admitted { gate: CONCURRENCY, client },
            Err(_) => GateEvent::Rejected { gate: CONCURRENCY, client },
        };
        self.telemetry.emit(GatewayEvent::Gate(event)).await;
        outcome
    }

    async fn try_enter(&self, client: &ClientKey) -> Result<ConcurrencyPermit, GatewayError> {
        let key = gate_key(CONCURRENCY, client.as_str());

        let active = match self.store.incr(&key).await {
            Ok(active) => active,
            Err(err) => {
                let failed_open = self.config.failure_mode == FailureMode::Open;
                report_store_failure(&self.telemetry, CONCURRENCY, client, failed_open).await;
                return match self.config.failure_mode {
                    FailureMode::Open => {
                        tracing::warn!(gate = CONCURRENCY, client = %client, error = %err, "store unavailable, failing open");
                        Ok(ConcurrencyPermit::uncounted())
                    }
                    FailureMode::Closed => {
                        tracing::error!(gate = CONCURRENCY, client = %client, error = %err, "store unavailable, failing closed");
                        Err(GatewayError::StoreUnavailable { gate: CONCURRENCY, source: err })
                    }
                };
            }
        };

        // From here on the counter was incremented, so every path must undo it.
        if active == 1 {
            if let Err(err) = self.store.pexpire(&key, self.config.ttl).await {
                tracing::warn!(gate = CONCURRENCY, client = %client, error = %err, "could not set safety ttl");
            }
        }

        if active > i64::from(self.config.max_concurrent) {
            if let Err(err) = self.store.decr(&key).await {
                tracing::warn!(gate = CONCURRENCY, client = %client, error = %err, "rollback failed, slot held until ttl");
            }
            tracing::info!(gate = CONCURRENCY, client = %client, active, "too many concurrent requests");
            return Err(GatewayError::QuotaExceeded(Quota::Concurrency {
                active,
                max: self.config.max_concurrent,
            }));
        }

        Ok(ConcurrencyPermit::counted(self.store.clone(), key))
    }

    /// Give the slot back. Equivalent to [`ConcurrencyPermit::release`].
    pub async fn exit(&self, permit: ConcurrencyPermit) {
        permit.release().await;
    }
}

#[derive(Debug)]
struct Slot {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl Slot {
    async fn free(self) {
        match self.store.decr(&self.key).await {
            Ok(remaining) if remaining <= 0 => {
                if let Err(err) = self.store.del(&self.key).await {
                    tracing::warn!(key = %self.key, error = %err, "could not delete drained counter");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "could not release slot, left to ttl");
            }
        }
    }
}

/// Proof of admission through the concurrency gate.
///
/// Releasing is idempotent: the slot is freed on the first `release` and a
/// permit dropped without one (client disconnect, panic, cancelled future)
/// frees it from a spawned task.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct ConcurrencyPermit {
    slot: Option<Slot>,
}

impl ConcurrencyPermit {
    fn counted(store: Arc<dyn CounterStore>, key: String) -> Self {
        Self { slot: Some(Slot { store, key }) }
    }

    /// Permit handed out while failing open; nothing to give back.
    pub fn uncounted() -> Self {
        Self { slot: None }
    }

    /// Whether this permit holds a slot in the store.
    pub fn is_counted(&self) -> bool {
        self.slot.is_some()
    }

    pub async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            slot.free().await;
        }
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(slot.free());
            }
            Err(_) => {
                tracing::warn!(key = %slot.key, "permit dropped outside a runtime, slot left to ttl");
            }
        }
    }
}
