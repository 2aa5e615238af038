//! Counter store interface shared by every admission gate.
//!
//! The store is the single source of truth for per-client quotas. Gates keep
//! no counters in process memory, so several gateway instances can point at
//! the same store. Operations mirror the Redis commands the networked backend
//! issues (`INCR`, `PEXPIRE`, `ZADD`, ...), each atomic on its own.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod memory;

pub use memory::InMemoryCounterStore;

/// Failure talking to the counter store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// A command was rejected, e.g. `INCR` against a non-integer value.
    #[error("store command `{command}` failed: {message}")]
    Command { command: &'static str, message: String },
    /// A stored value could not be interpreted.
    #[error("unexpected stored value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

/// Atomic counter, key/value and sorted-set primitives with millisecond TTLs.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment an integer key, creating it at 0 first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Decrement an integer key, creating it at 0 first. Returns the new value.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Remove a key of any type.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Set a time-to-live on an existing key. Returns `false` when the key is absent.
    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value that expires after `ttl`.
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Add (or re-score) a sorted-set member.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Keys matching a glob pattern (`*` wildcard). Diagnostic use only.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Namespaced store key for a gate and client, e.g. `throttle:10.0.0.7`.
pub fn gate_key(gate: &str, client: &str) -> String {
    format!("{}:{}", gate, client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_gate() {
        assert_eq!(gate_key("throttle", "10.0.0.7"), "throttle:10.0.0.7");
        assert_eq!(gate_key("rate_limiter", "alice"), "rate_limiter:alice");
        assert_ne!(gate_key("concurrency", "a"), gate_key("throttle", "a"));
    }
}
