mod common;

use axum::http::StatusCode;
use common::*;
use std::time::Duration;
use tixgate::telemetry::{GateEvent, GatewayEvent};
use tower::ServiceExt;

fn spaced() -> Duration {
    Duration::from_millis(1_100)
}

#[tokio::test]
async fn rate_gate_admits_budget_then_rejects() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));

    for i in 0..5 {
        let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {}", i + 1);
        h.clock.advance(spaced());
    }

    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(response).await["error"], "Too many requests. Rate limit reached");

    // Other clients keep their own budget.
    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_window_slides() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    for _ in 0..5 {
        h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.3")).await.unwrap();
        h.clock.advance(spaced());
    }
    h.clock.advance(Duration::from_secs(60));
    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_budget_follows_the_user_not_the_address() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let token = token("tina", "user");
    for i in 0..5 {
        // A new address each time; the username is the rate key.
        let peer = format!("10.0.1.{}", i);
        let response =
            h.gateway.router().oneshot(request("GET", "/api/test", Some(&token), &peer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response =
        h.gateway.router().oneshot(request("GET", "/api/test", Some(&token), "10.0.1.99")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(h.store.zcard("rate_limiter:tina").await.unwrap(), 5);
}

#[tokio::test]
async fn throttle_rejects_with_retry_hint() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));

    let first = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.4")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    h.clock.advance(Duration::from_millis(250));
    let second = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.4")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(second).await;
    assert_eq!(body["error"], "Too many requests - you are being throttled.");
    assert_eq!(body["retryIn"], 750);

    h.clock.advance(Duration::from_millis(750));
    let third = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.4")).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
}

#[tokio::test]
async fn concurrency_gate_rejects_when_slots_are_taken() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    for _ in 0..3 {
        h.store.incr("concurrency:10.0.0.5").await.unwrap();
    }

    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(response).await["error"], "Too many concurrent requests");
    // The rejected request's increment was rolled back.
    assert_eq!(h.store.get("concurrency:10.0.0.5").await.unwrap().as_deref(), Some("3"));

    let rejected = h.events.events().into_iter().any(|e| {
        e == GatewayEvent::Gate(GateEvent::Rejected { gate: "concurrency", client: "10.0.0.5".into() })
    });
    assert!(rejected);
}

#[tokio::test]
async fn concurrency_slot_is_released_after_the_response() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.6")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.store.get("concurrency:10.0.0.6").await.unwrap(), None);
}

#[tokio::test]
async fn concurrency_slot_is_released_when_a_later_stage_rejects() {
    let mut config = config();
    config.rate.max_requests = 1;
    let h = harness(config, ScriptedUpstream::new(vec![]));

    let response =
        h.gateway.router().oneshot(request("GET", "/api/reservations/v1", None, "10.0.0.20")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.store.get("concurrency:10.0.0.20").await.unwrap(), None);

    let buyer = token("bo", "user");
    let response =
        h.gateway.router().oneshot(request("POST", "/api/events/v1", Some(&buyer), "10.0.0.21")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.store.get("concurrency:10.0.0.21").await.unwrap(), None);

    h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.22")).await.unwrap();
    h.clock.advance(spaced());
    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.22")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(h.store.get("concurrency:10.0.0.22").await.unwrap(), None);
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn concurrency_slot_is_released_when_the_client_goes_away() {
    let h = harness(config(), ScriptedUpstream::hanging());
    let mut in_flight =
        Box::pin(h.gateway.router().oneshot(request("GET", "/api/events/v1", None, "10.0.0.23")));

    let finished = tokio::time::timeout(Duration::from_millis(50), &mut in_flight).await;
    assert!(finished.is_err(), "a hanging upstream must not answer");
    assert_eq!(h.upstream.calls(), 1);
    assert_eq!(h.store.get("concurrency:10.0.0.23").await.unwrap(), Some("1".to_string()));

    drop(in_flight);
    let mut released = false;
    for _ in 0..10 {
        tokio::task::yield_now().await;
        if h.store.get("concurrency:10.0.0.23").await.unwrap().is_none() {
            released = true;
            break;
        }
    }
    assert!(released, "dropped request kept its concurrency slot");
}

#[tokio::test]
async fn store_outage_fails_open_except_for_rate() {
    let h = harness_down(config(), ScriptedUpstream::new(vec![]));

    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.7")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"], "Internal server error");

    let failures: Vec<(&'static str, bool)> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            GatewayEvent::Gate(GateEvent::StoreFailure { gate, failed_open, .. }) => Some((gate, failed_open)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![("throttle", true), ("concurrency", true), ("rate_limiter", false)]);
}

#[tokio::test]
async fn store_outage_with_open_rate_lets_requests_through() {
    let mut config = config();
    config.rate.failure_mode = tixgate::FailureMode::Open;
    let h = harness_down(config, ScriptedUpstream::new(vec![]));

    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.0.0.8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
