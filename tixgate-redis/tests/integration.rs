use std::time::Duration;
use tixgate::store::CounterStore;
use tixgate_redis::RedisCounterStore;

// Requires Redis running. If TIXGATE_TEST_REDIS_URL is unset, the tests skip.
async fn store() -> Option<RedisCounterStore> {
    let url = match std::env::var("TIXGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set TIXGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return None;
        }
    };
    Some(
        RedisCounterStore::connect(&url)
            .await
            .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e)),
    )
}

fn key(name: &str) -> String {
    format!("tixgate-test:{}:{}", name, uuid::Uuid::new_v4())
}

#[tokio::test]
async fn counters_round_trip_through_redis() {
    let Some(store) = store().await else { return };
    let k = key("concurrency");

    assert_eq!(store.incr(&k).await.unwrap(), 1);
    assert!(store.pexpire(&k, Duration::from_secs(30)).await.unwrap());
    assert_eq!(store.incr(&k).await.unwrap(), 2);
    assert_eq!(store.decr(&k).await.unwrap(), 1);
    assert_eq!(store.get(&k).await.unwrap().as_deref(), Some("1"));
    store.del(&k).await.unwrap();
    assert_eq!(store.get(&k).await.unwrap(), None);
    assert!(!store.pexpire(&k, Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn sorted_set_window_operations() {
    let Some(store) = store().await else { return };
    let k = key("rate");

    for (score, member) in [(100, "a"), (200, "b"), (300, "c")] {
        store.zadd(&k, score, member).await.unwrap();
    }
    assert_eq!(store.zremrangebyscore(&k, 0, 200).await.unwrap(), 2);
    assert_eq!(store.zcard(&k).await.unwrap(), 1);

    store.set_px(&k, "x", Duration::from_secs(30)).await.unwrap();
    assert!(store.keys("tixgate-test:rate:*").await.unwrap().contains(&k));
    store.del(&k).await.unwrap();
}
