//! Redis counter store for `tixgate` (companion crate).
//!
//! Every gate operation maps onto one Redis command, so increments,
//! decrements and sorted-set updates stay atomic across gateway instances
//! sharing the same server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, RedisError};
use std::time::Duration;
use tixgate::store::{CounterStore, StoreError};

/// `CounterStore` over a reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").field("conn", &"<ConnectionManager>").finish()
    }
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://redis:6379`).
    ///
    /// # Errors
    /// Returns `StoreError::Connection` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        tracing::info!(target: "tixgate::redis", "connected to redis");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn run<T: FromRedisValue>(&self, command: &'static str, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| map_error(command, e))
    }
}

fn map_error(command: &'static str, err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        tracing::warn!(target: "tixgate::redis", command, error = %err, "redis connection problem");
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command { command, message: err.to_string() }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.run("INCR", redis::cmd("INCR").arg(key)).await
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.run("DECR", redis::cmd("DECR").arg(key)).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.run("DEL", redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let set: i64 = self.run("PEXPIRE", redis::cmd("PEXPIRE").arg(key).arg(millis(ttl))).await?;
        Ok(set == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.run("SET", redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis(ttl))).await
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let _: i64 = self.run("ZADD", redis::cmd("ZADD").arg(key).arg(score).arg(member)).await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        self.run("ZREMRANGEBYSCORE", redis::cmd("ZREMRANGEBYSCORE").arg(key).arg(min).arg(max)).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.run("ZCARD", redis::cmd("ZCARD").arg(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        // SCAN instead of KEYS so a large keyspace does not block the server.
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run("SCAN", redis::cmd("SCAN").arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(500))
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
