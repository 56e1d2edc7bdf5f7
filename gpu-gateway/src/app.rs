use axum::extract::State;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use common_http_errors::ApiError;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, warn};

use crate::app_state::AppState;
use crate::auth::auth_middleware;
use crate::auth_handlers::{issue_api_key, login};
use crate::gpu_handlers::{
    batch_create, create_instance, destroy_instance, list_instances, proxy_unary, proxy_upgrade,
    reserve_instances,
};
use crate::guardrails_handlers::{get_spending, post_check, post_reset};
use crate::lb_handlers::{get_loads, get_strategy, put_strategy};
use crate::pipeline::{guardrails_middleware, ip_access_middleware, request_id_middleware};

async fn health(State(state): State<AppState>) -> Response {
    let database = match &state.pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "ok",
            Err(err) => {
                warn!(?err, "database health check failed");
                "down"
            }
        },
        None => "skipped",
    };
    let spend_store = match state.guardrails.store().ping().await {
        Ok(()) => "ok",
        Err(err) => {
            warn!(?err, "spend store health check failed");
            "down"
        }
    };
    let healthy = database != "down" && spend_store != "down";
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "checks": { "database": database, "spend_store": spend_store },
    }));
    (status, body).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    state.metrics.set_audit_dropped(state.audit_sink.dropped());
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("panic payload not a string");
    error!(detail, "request handler panicked");
    ApiError::Internal { request_id: None, message: None }.into_response()
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods(
            [Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS]
                .into_iter()
                .collect::<Vec<_>>(),
        )
        .allow_headers(
            [
                ACCEPT,
                CONTENT_TYPE,
                HeaderName::from_static("authorization"),
                HeaderName::from_static("x-api-key"),
            ]
            .into_iter()
            .collect::<Vec<_>>(),
        );

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/apikey", post(issue_api_key))
        .route("/api/v1/gpu/instances", get(list_instances))
        .route("/api/v1/gpu/instances/batch", post(batch_create))
        .route("/api/v1/gpu/instances/reserve", post(reserve_instances))
        .route(
            "/api/v1/gpu/instances/:provider/:id",
            post(create_instance).delete(destroy_instance),
        )
        .route("/api/v1/gpu/proxy", get(proxy_upgrade).post(proxy_unary))
        .route("/api/v1/loadbalancer/loads", get(get_loads))
        .route("/api/v1/loadbalancer/strategy", get(get_strategy).put(put_strategy))
        .route("/api/v1/guardrails/spending", get(get_spending))
        .route("/api/v1/guardrails/check", post(post_check))
        .route("/api/v1/guardrails/reset", post(post_reset))
        .layer(middleware::from_fn_with_state(state.clone(), guardrails_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), ip_access_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), request_id_middleware))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors)
        .with_state(state)
}
