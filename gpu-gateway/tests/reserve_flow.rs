mod support;

use axum::http::StatusCode;
use gpu_gateway::load_balancer::Strategy;
use std::collections::HashSet;
use support::{body_json, instance, Harness};

/// Weighted reserve over five matching candidates (VRAM 40,40,80,80,80):
/// three reservations, biased to the 80 GB tier, each with a distinct
/// self-hosted port.
#[tokio::test]
async fn weighted_reserve_prefers_high_vram_and_assigns_unique_ports() {
    let harness = Harness::builder()
        .strategy(Strategy::WeightedRoundRobin)
        .instances(vec![
            instance("a", 40, 1.0),
            instance("b", 40, 1.0),
            instance("c", 80, 1.0),
            instance("d", 80, 1.0),
            instance("e", 80, 1.0),
        ])
        .build();

    let request = harness.post_json(
        "/api/v1/gpu/instances/reserve",
        serde_json::json!({"count": 3, "filters": {"min_vram": 40}}),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 3);
    let reservations = body["reservations"].as_array().unwrap();
    assert_eq!(reservations.len(), 3);

    let mut ports = HashSet::new();
    for reservation in reservations {
        let port = reservation["port"].as_u64().unwrap();
        assert!((3000..=15000).contains(&port), "port {port} outside self-hosted range");
        assert!(ports.insert(port), "port {port} assigned twice");
        let picked = reservation["instance_id"].as_str().unwrap();
        assert!(
            ["c", "d", "e"].contains(&picked),
            "weighted pick should prefer 80 GB instances, got {picked}"
        );
        assert_eq!(reservation["state"], "active");
    }
}

#[tokio::test]
async fn reserve_count_bounds_are_enforced() {
    let harness = Harness::new();
    for count in [0, 17] {
        let request = harness.post_json(
            "/api/v1/gpu/instances/reserve",
            serde_json::json!({"count": count}),
        );
        let response = harness.send(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "count {count}");
    }
}

#[tokio::test]
async fn partial_success_reports_slot_errors() {
    let harness = Harness::builder()
        .instances(vec![instance("a", 40, 1.0), instance("b", 40, 1.0)])
        .build();
    let request = harness.post_json(
        "/api/v1/gpu/instances/reserve",
        serde_json::json!({"count": 5}),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["errors"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn no_matching_instances_is_404() {
    let harness = Harness::new();
    let request = harness.post_json(
        "/api/v1/gpu/instances/reserve",
        serde_json::json!({"count": 1, "filters": {"min_vram": 4000}}),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_endpoint_applies_query_filters() {
    let harness = Harness::builder()
        .instances(vec![
            instance("small", 24, 0.4),
            instance("big", 80, 2.4),
        ])
        .build();
    let response = harness
        .send(harness.get("/api/v1/gpu/instances?min_vram=40"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["instances"][0]["id"], "big");
}

#[tokio::test]
async fn create_then_destroy_round_trip() {
    let harness = Harness::builder().instances(vec![instance("a", 40, 1.0)]).build();
    let response = harness
        .send(harness.post_json("/api/v1/gpu/instances/selfhosted/a", serde_json::json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["contract_id"], "selfhosted-a");

    // Second create conflicts while reserved.
    let response = harness
        .send(harness.post_json("/api/v1/gpu/instances/selfhosted/a", serde_json::json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let mut destroy = harness.post_json("/api/v1/gpu/instances/selfhosted/a", serde_json::json!({}));
    *destroy.method_mut() = axum::http::Method::DELETE;
    *destroy.body_mut() = axum::body::Body::empty();
    let response = harness.send(destroy).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn batch_create_validates_per_provider_counts() {
    let harness = Harness::new();
    let request = harness.post_json(
        "/api/v1/gpu/instances/batch",
        serde_json::json!({"vastai_count": 9, "ionet_count": 0}),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unregistered vendor adapters surface as per-provider errors, not a
    // request failure.
    let request = harness.post_json(
        "/api/v1/gpu/instances/batch",
        serde_json::json!({"vastai_count": 2, "ionet_count": 1}),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["reservations"].as_array().unwrap().len(), 0);
    assert!(body["errors"]["vastai"].is_array());
    assert!(body["errors"]["ionet"].is_array());
}
