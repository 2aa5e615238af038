use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Str(String),
    // (score, member) ordered by score first, like a Redis sorted set.
    Sorted(BTreeSet<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

/// Single-process `CounterStore` with lazy TTL expiry.
///
/// Expired keys are dropped when next touched, so the store needs no
/// background sweeper. Time comes from an injected [`Clock`], letting tests
/// move past windows without sleeping.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { data: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live entry for `key`, evicting it first if its TTL has passed.
    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: u64,
    ) -> Option<&'a mut Entry> {
        let expired = map.get(key).and_then(|e| e.expires_at).is_some_and(|at| at <= now);
        if expired {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn add(&self, key: &str, delta: i64, command: &'static str) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            Some(entry) => {
                let current = match &entry.value {
                    Value::Int(n) => *n,
                    Value::Str(s) => s.parse::<i64>().map_err(|_| StoreError::Command {
                        command,
                        message: "value is not an integer".into(),
                    })?,
                    Value::Sorted(_) => {
                        return Err(StoreError::Command {
                            command,
                            message: "wrong kind of value".into(),
                        })
                    }
                };
                let next = current.checked_add(delta).ok_or_else(|| StoreError::Command {
                    command,
                    message: "increment or decrement would overflow".into(),
                })?;
                // TTL survives, as with Redis INCR/DECR.
                entry.value = Value::Int(next);
                Ok(next)
            }
            None => {
                map.insert(key.to_string(), Entry { value: Value::Int(delta), expires_at: None });
                Ok(delta)
            }
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let last = rest[rest.len() - 1];
    for middle in &rest[..rest.len() - 1] {
        match remaining.find(middle) {
            Some(idx) => remaining = &remaining[idx + middle.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1, "INCR")
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1, "DECR")
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live(&mut map, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(Self::ttl_millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live(&mut map, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Int(n)) => Ok(Some(n.to_string())),
            Some(Value::Sorted(_)) => Err(StoreError::Command {
                command: "GET",
                message: "wrong kind of value".into(),
            }),
        }
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now.saturating_add(Self::ttl_millis(ttl))),
            },
        );
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        let _ = Self::live(&mut map, key, now);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Sorted(set) => {
                set.retain(|(_, m)| m != member);
                set.insert((score, member.to_string()));
                Ok(())
            }
            _ => Err(StoreError::Command { command: "ZADD", message: "wrong kind of value".into() }),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        let Some(entry) = Self::live(&mut map, key, now) else {
            return Ok(0);
        };
        let removed = match &mut entry.value {
            Value::Sorted(set) => {
                let before = set.len();
                set.retain(|(score, _)| *score < min || *score > max);
                (before - set.len()) as u64
            }
            _ => {
                return Err(StoreError::Command {
                    command: "ZREMRANGEBYSCORE",
                    message: "wrong kind of value".into(),
                })
            }
        };
        // Redis deletes a sorted set once its last member goes.
        if matches!(&entry.value, Value::Sorted(set) if set.is_empty()) {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live(&mut map, key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Sorted(set)) => Ok(set.len() as u64),
            Some(_) => {
                Err(StoreError::Command { command: "ZCARD", message: "wrong kind of value".into() })
            }
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        map.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        let mut keys: Vec<String> = map.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryCounterStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn incr_and_decr_track_the_counter() {
        let (store, _) = store();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);
        assert_eq!(store.decr("missing").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn ttl_expires_lazily_and_survives_incr() {
        let (store, clock) = store();
        store.incr("c").await.unwrap();
        assert!(store.pexpire("c", Duration::from_millis(100)).await.unwrap());
        clock.advance(Duration::from_millis(60));
        assert_eq!(store.incr("c").await.unwrap(), 2);
        clock.advance(Duration::from_millis(40));
        assert_eq!(store.get("c").await.unwrap(), None);
        assert_eq!(store.incr("c").await.unwrap(), 1, "fresh counter after expiry");
    }

    #[tokio::test]
    async fn pexpire_on_missing_key_is_false() {
        let (store, _) = store();
        assert!(!store.pexpire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn set_px_expires() {
        let (store, clock) = store();
        store.set_px("t", "123", Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.get("t").await.unwrap().as_deref(), Some("123"));
        clock.advance(Duration::from_millis(10));
        assert_eq!(store.get("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sorted_set_range_removal_is_inclusive() {
        let (store, _) = store();
        for score in [10, 20, 30] {
            store.zadd("z", score, &format!("m{}", score)).await.unwrap();
        }
        assert_eq!(store.zremrangebyscore("z", 0, 20).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zremrangebyscore("z", 0, 100).await.unwrap(), 1);
        assert!(store.keys("*").await.unwrap().is_empty(), "empty set is deleted");
    }

    #[tokio::test]
    async fn zadd_same_member_rescores() {
        let (store, _) = store();
        store.zadd("z", 1, "a").await.unwrap();
        store.zadd("z", 5, "a").await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zremrangebyscore("z", 0, 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_a_command_error() {
        let (store, _) = store();
        store.zadd("z", 1, "a").await.unwrap();
        assert!(matches!(store.incr("z").await, Err(StoreError::Command { command: "INCR", .. })));
    }

    #[tokio::test]
    async fn keys_filters_by_glob_and_skips_expired() {
        let (store, clock) = store();
        store.incr("concurrency:1.1.1.1").await.unwrap();
        store.set_px("throttle:1.1.1.1", "1", Duration::from_millis(5)).await.unwrap();
        store.zadd("rate_limiter:bob", 1, "x").await.unwrap();

        assert_eq!(store.keys("*").await.unwrap().len(), 3);
        assert_eq!(store.keys("throttle:*").await.unwrap(), vec!["throttle:1.1.1.1"]);
        clock.advance(Duration::from_millis(5));
        assert_eq!(
            store.keys("*").await.unwrap(),
            vec!["concurrency:1.1.1.1".to_string(), "rate_limiter:bob".to_string()]
        );
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a*b*c", "a-b-c"));
        assert!(!glob_match("a*c", "abd"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("ab*ab", "ab"));
    }
}
