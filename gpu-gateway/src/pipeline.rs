use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use std::net::SocketAddr;
use tracing::warn;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::TenantCtx;
use crate::ip_access::extract_client_ip;

/// Correlation id for logs and error bodies, one per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Outermost of the app middlewares: stamps the correlation id and counts
/// every completed request by outcome.
pub async fn request_id_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);
    let mut response = next.run(request).await;
    let outcome = if response.status().is_server_error() {
        "server_error"
    } else if response.status().is_client_error() {
        "client_error"
    } else {
        "success"
    };
    state.metrics.record_request(outcome);
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// IP allow/deny enforcement. Runs after authentication; public paths carry
/// no tenant context and pass through.
pub async fn ip_access_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request.extensions().get::<RequestId>().map(|id| id.0);
    let Some(ctx) = request.extensions().get::<TenantCtx>().cloned() else {
        return Ok(next.run(request).await);
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let Some(client_ip) = extract_client_ip(request.headers(), peer) else {
        return Err(ApiError::Malformed {
            code: "unparseable_client_ip",
            request_id,
            message: Some("client address is not a valid IPv4/IPv6 address".into()),
        });
    };

    let outcome = state
        .ip_access
        .check(ctx.tenant_id, client_ip, request.uri().path())
        .await
        .map_err(|err| {
            warn!(?err, tenant_id = %ctx.tenant_id, "ip access check failed");
            ApiError::internal("ip access check failed", request_id)
        })?;

    if !outcome.allowed {
        state.metrics.record_ip_denial(outcome.match_type.as_str());
        return Err(ApiError::Forbidden { request_id, reason: outcome.reason });
    }
    Ok(next.run(request).await)
}

/// Guard-rails pre-check with the nominal estimate, plus spend headers on
/// every response that carried a tenant.
pub async fn guardrails_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request.extensions().get::<RequestId>().map(|id| id.0);
    let Some(ctx) = request.extensions().get::<TenantCtx>().cloned() else {
        // Identity absent: an earlier stage rejected or the route is public.
        return next.run(request).await;
    };
    if !state.guardrails.enabled() {
        return next.run(request).await;
    }

    let outcome = match state
        .guardrails
        .check(ctx.tenant_id, state.config.guardrails_precheck_cost)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(?err, tenant_id = %ctx.tenant_id, "guardrails pre-check failed");
            return ApiError::internal("spend check failed", request_id).into_response();
        }
    };

    if !outcome.allowed {
        for violation in &outcome.violations {
            state.metrics.record_guardrail_violation(&violation.window);
        }
        let mut response = ApiError::LimitExceeded {
            request_id,
            violations: outcome.violations.clone(),
        }
        .into_response();
        response
            .headers_mut()
            .insert("X-GuardRails-Enabled", HeaderValue::from_static("true"));
        response
            .headers_mut()
            .insert("X-GuardRails-Exceeded", HeaderValue::from_static("true"));
        append_spend_headers(&mut response, &outcome.spent);
        return response;
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("X-GuardRails-Enabled", HeaderValue::from_static("true"));
    if response.status() == axum::http::StatusCode::PAYMENT_REQUIRED {
        response
            .headers_mut()
            .insert("X-GuardRails-Exceeded", HeaderValue::from_static("true"));
    }
    append_spend_headers(&mut response, &outcome.spent);
    response
}

fn append_spend_headers(
    response: &mut Response,
    spent: &std::collections::HashMap<&'static str, f64>,
) {
    for (window, amount) in spent {
        let name = format!("X-GuardRails-{window}");
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&format!("{amount:.4}")),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}
