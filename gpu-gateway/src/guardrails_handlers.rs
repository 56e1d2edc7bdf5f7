use axum::extract::State;
use axum::Json;
use common_http_errors::{ApiError, ApiResult, SpendViolation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::TenantCtxExtractor;

#[derive(Serialize)]
pub struct SpendingResponse {
    pub enabled: bool,
    pub spent: HashMap<&'static str, f64>,
    pub limits: HashMap<&'static str, f64>,
}

pub async fn get_spending(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
) -> ApiResult<Json<SpendingResponse>> {
    let outcome = state
        .guardrails
        .check(ctx.tenant_id, 0.0)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    let limits = state.guardrails.active_windows().map(|(w, limit)| (w.name, limit)).collect();
    Ok(Json(SpendingResponse {
        enabled: state.guardrails.enabled(),
        spent: outcome.spent,
        limits,
    }))
}

#[derive(Deserialize)]
pub struct CheckRequest {
    pub estimated_cost: f64,
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub spent: HashMap<&'static str, f64>,
    pub violations: Vec<SpendViolation>,
}

/// Explicit admission probe with the caller's own estimate. A violation is a
/// 402 carrying the violation list, same shape as the middleware's denial.
pub async fn post_check(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Json(request): Json<CheckRequest>,
) -> ApiResult<Json<CheckResponse>> {
    if !request.estimated_cost.is_finite() || request.estimated_cost < 0.0 {
        return Err(ApiError::Malformed {
            code: "bad_estimate",
            request_id: None,
            message: Some("estimated_cost must be a non-negative number".into()),
        });
    }
    let outcome = state
        .guardrails
        .check(ctx.tenant_id, request.estimated_cost)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    if !outcome.allowed {
        for violation in &outcome.violations {
            state.metrics.record_guardrail_violation(&violation.window);
        }
        return Err(ApiError::LimitExceeded { request_id: None, violations: outcome.violations });
    }
    Ok(Json(CheckResponse {
        allowed: true,
        spent: outcome.spent,
        violations: Vec::new(),
    }))
}

#[derive(Deserialize)]
pub struct ResetRequest {
    /// Defaults to the calling tenant.
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    /// Absent means all windows.
    #[serde(default)]
    pub window: Option<String>,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub tenant_id: Uuid,
    pub windows_reset: usize,
}

/// Admin-only, including resets of the caller's own counters.
pub async fn post_reset(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Json(request): Json<ResetRequest>,
) -> ApiResult<Json<ResetResponse>> {
    if !ctx.admin {
        return Err(ApiError::Forbidden {
            request_id: None,
            reason: Some("guard-rail resets require an admin tenant".into()),
        });
    }
    let target = request.tenant_id.unwrap_or(ctx.tenant_id);
    let windows_reset = state
        .guardrails
        .reset(target, request.window.as_deref())
        .await
        .map_err(|_| ApiError::NotFound { code: "unknown_window", request_id: None })?;
    info!(tenant_id = %target, windows_reset, "guardrail counters reset");
    Ok(Json(ResetResponse { tenant_id: target, windows_reset }))
}
