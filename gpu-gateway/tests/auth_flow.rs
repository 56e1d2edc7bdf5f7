mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use support::{body_json, Harness, TEST_CLIENT_IP};

#[tokio::test]
async fn login_exchanges_api_key_for_bearer_token() {
    let harness = Harness::new();
    let login = Request::builder()
        .method("POST")
        .uri("/api/v1/auth/login")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({"api_key": harness.api_key}).to_string(),
        ))
        .unwrap();
    let response = harness.send(login).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let token = body["access_token"].as_str().unwrap().to_string();
    assert_eq!(body["token_type"], "Bearer");
    assert!(body["expires_in"].as_i64().unwrap() > 0);

    // The bearer token works on protected routes.
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/gpu/instances")
        .header("Authorization", format!("Bearer {token}"))
        .header("X-Forwarded-For", TEST_CLIENT_IP)
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_with_unknown_key_is_401() {
    let harness = Harness::new();
    let login = Request::builder()
        .method("POST")
        .uri("/api/v1/auth/login")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::json!({"api_key": "gpx_bogus"}).to_string()))
        .unwrap();
    let response = harness.send(login).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn issued_api_key_is_shown_once_and_usable() {
    let harness = Harness::new();
    let response = harness
        .send(harness.post_json("/api/v1/auth/apikey", serde_json::json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let fresh_key = body["api_key"].as_str().unwrap().to_string();
    assert!(fresh_key.starts_with("gpx_"));

    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/gpu/instances")
        .header("X-API-Key", &fresh_key)
        .header("X-Forwarded-For", TEST_CLIENT_IP)
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

/// Revocation takes effect within the session TTL: stale cache entries may
/// admit the key briefly, never longer.
#[tokio::test]
async fn revoked_key_stops_working_within_session_ttl() {
    let harness = Harness::builder().session_ttl(Duration::from_millis(100)).build();

    let response = harness.send(harness.get("/api/v1/gpu/instances")).await;
    assert_eq!(response.status(), StatusCode::OK);

    harness.credentials.revoke_key(&harness.api_key);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = harness.send(harness.get("/api/v1/gpu/instances")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
