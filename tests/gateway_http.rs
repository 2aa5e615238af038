mod common;

use axum::http::StatusCode;
use common::*;
use tower::ServiceExt;

#[tokio::test]
async fn test_endpoint_is_open_and_tagged_with_instance() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let response = h.gateway.router().oneshot(request("GET", "/api/test", None, "10.2.0.1")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-instance"], "gw-test");
    assert_eq!(json_body(response).await["message"], "Success! You have not hit the rate limit.");
}

#[tokio::test]
async fn protected_path_without_token_is_unauthorized() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let response =
        h.gateway.router().oneshot(request("GET", "/api/reservations/v1", None, "10.2.0.2")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["x-gateway-instance"], "gw-test");
    assert_eq!(json_body(response).await["error"], "Unauthorized");
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn garbage_token_is_unauthorized() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let response = h
        .gateway
        .router()
        .oneshot(request("GET", "/api/reservations/v1", Some("not.a.jwt"), "10.2.0.3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn vendor_routes_check_the_role() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));

    let buyer = token("bo", "user");
    let response =
        h.gateway.router().oneshot(request("POST", "/api/events/v1", Some(&buyer), "10.2.0.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "Forbidden: insufficient role");
    assert_eq!(h.upstream.calls(), 0);

    let vendor = token("vera", "vendor");
    let response =
        h.gateway.router().oneshot(request("POST", "/api/events/v1", Some(&vendor), "10.2.0.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn buyers_may_reserve_on_vendor_paths() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let buyer = token("bo", "user");
    let response = h
        .gateway
        .router()
        .oneshot(request("POST", "/api/events/v1/12/reserve", Some(&buyer), "10.2.0.6"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.upstream.seen()[0].url.as_str(), "http://event-service:8080/v1/12/reserve");
}

#[tokio::test]
async fn open_paths_need_no_token() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let response =
        h.gateway.router().oneshot(request("POST", "/api/auth/login", None, "10.2.0.7")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let seen = h.upstream.seen();
    assert_eq!(seen[0].url.as_str(), "http://auth-service:8080/login");
    assert!(!seen[0].headers.contains_key("username"));
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let token = token("tina", "user");
    let response =
        h.gateway.router().oneshot(request("GET", "/api/nowhere", Some(&token), "10.2.0.8")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn store_keys_lists_gate_state() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    h.gateway.router().oneshot(request("GET", "/api/test", None, "10.2.0.9")).await.unwrap();

    let response =
        h.gateway.router().oneshot(request("GET", "/debug/store-keys", None, "10.2.0.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-instance"], "gw-test");
    let body = json_body(response).await;
    let keys: Vec<&str> = body["keys"].as_array().unwrap().iter().map(|k| k.as_str().unwrap()).collect();
    assert_eq!(keys, vec!["rate_limiter:10.2.0.9", "throttle:10.2.0.9"]);
}

#[tokio::test]
async fn store_keys_reports_store_failure() {
    let h = harness_down(config(), ScriptedUpstream::new(vec![]));
    let response =
        h.gateway.router().oneshot(request("GET", "/debug/store-keys", None, "10.2.0.10")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"], "Failed to fetch store keys");
}

#[tokio::test]
async fn concurrency_counter_is_gone_after_a_forwarded_request() {
    let h = harness(config(), ScriptedUpstream::new(vec![]));
    let token = token("tina", "user");
    let response =
        h.gateway.router().oneshot(request("GET", "/api/tickets/v1/3", Some(&token), "10.2.0.11")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "ok");
    assert_eq!(h.store.get("concurrency:10.2.0.11").await.unwrap(), None);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = config();
    config.max_body_bytes = 16;
    let h = harness(config, ScriptedUpstream::new(vec![]));

    let mut req = request("POST", "/api/users", None, "10.2.0.12");
    *req.body_mut() = axum::body::Body::from(vec![b'x'; 64]);
    let response = h.gateway.router().oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(h.upstream.calls(), 0);
}
