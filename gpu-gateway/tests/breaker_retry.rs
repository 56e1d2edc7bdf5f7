mod support;

use axum::http::StatusCode;
use gpu_gateway::config::{BreakerConfig, RetryConfig};
use httpmock::prelude::*;
use support::{instance, Harness};

fn breaker(timeout_secs: u64) -> BreakerConfig {
    BreakerConfig {
        interval_secs: 60,
        timeout_secs,
        min_requests: 10,
        failure_ratio: 0.6,
        half_open_max: 3,
        half_open_successes: 1,
    }
}

fn proxy_body(target: &str) -> serde_json::Value {
    serde_json::json!({
        "protocol": "http",
        "target_url": target,
        "method": "POST",
    })
}

/// Breaker trip: after 20 consecutive 503s the next call short-circuits with
/// 503 circuit_open and no network egress; once the open timeout elapses a
/// half-open probe is admitted and a success closes the breaker.
#[tokio::test]
async fn breaker_trips_short_circuits_then_recovers() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/infer");
            then.status(503).body("overloaded");
        })
        .await;

    let harness = Harness::builder()
        .instances(vec![instance("a", 40, 1.0)])
        .breaker(breaker(2))
        // One attempt per call so the trip arithmetic is exact.
        .retry(RetryConfig { max_attempts: 1, initial_ms: 1, cap_ms: 2 })
        .build();
    let target = server.url("/infer");

    // The first ten calls reach the backend; the tenth failure satisfies
    // min_requests and the 60 % ratio, tripping the breaker.
    for call in 0..10 {
        let response = harness
            .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY, "call {call}");
    }
    failing.assert_hits_async(10).await;

    // Every further call short-circuits with 503 and no network egress.
    for call in 10..21 {
        let response = harness
            .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "call {call}");
        assert_eq!(response.headers().get("X-Error-Code").unwrap(), "circuit_open");
        assert!(response.headers().contains_key("Retry-After"));
    }
    failing.assert_hits_async(10).await;

    let metrics = harness
        .send(
            axum::http::Request::builder()
                .uri("/metrics")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    let text = support::body_string(metrics).await;
    assert!(
        text.contains("gateway_breaker_transitions_total{state=\"open\"}"),
        "breaker trip must be counted"
    );

    // After the open timeout the half-open probe flows and a success closes.
    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
    failing.delete_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(POST).path("/infer");
            then.status(200).body("ok");
        })
        .await;

    let response = harness
        .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
        .await;
    assert_eq!(response.status(), StatusCode::OK, "half-open probe admitted");
    let response = harness
        .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
        .await;
    assert_eq!(response.status(), StatusCode::OK, "breaker closed after probe success");
    healthy.assert_hits_async(2).await;
}

/// With retries enabled, an open breaker is treated as retryable so backoff
/// bridges into the half-open probe within one proxy call.
#[tokio::test]
async fn retry_layer_bridges_open_breaker_into_half_open() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/infer");
            then.status(503).body("overloaded");
        })
        .await;

    let harness = Harness::builder()
        .instances(vec![instance("a", 40, 1.0)])
        .breaker(BreakerConfig { min_requests: 2, failure_ratio: 0.5, ..breaker(1) })
        // Jittered backoff is at least 1.1 s, past the 1 s open window.
        .retry(RetryConfig { max_attempts: 2, initial_ms: 2200, cap_ms: 5000 })
        .build();
    let target = server.url("/infer");

    // One failing call carries two attempts: the second trips the breaker.
    let response = harness
        .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    failing.assert_hits_async(2).await;

    failing.delete_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(POST).path("/infer");
            then.status(200).body("ok");
        })
        .await;

    // The breaker is open now, yet a single call succeeds: the open-breaker
    // attempt errors are retryable, and backoff carries the last attempt
    // into the half-open window.
    let response = harness
        .send(harness.post_json("/api/v1/gpu/proxy", proxy_body(&target)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    healthy.assert_hits_async(1).await;
}
