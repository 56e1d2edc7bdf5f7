use axum::extract::State;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::app_state::AppState;
use crate::auth::TenantCtxExtractor;
use crate::load_balancer::{InstanceLoad, Strategy};

pub async fn get_loads(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
) -> Json<HashMap<String, InstanceLoad>> {
    Json(state.lb.loads())
}

#[derive(Serialize)]
pub struct StrategyResponse {
    pub strategy: &'static str,
}

pub async fn get_strategy(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
) -> Json<StrategyResponse> {
    Json(StrategyResponse { strategy: state.lb.strategy().as_str() })
}

#[derive(Deserialize)]
pub struct SetStrategyRequest {
    pub strategy: String,
}

/// Admin-only runtime swap. The load table is strategy-independent and is
/// kept across the change.
pub async fn put_strategy(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Json(request): Json<SetStrategyRequest>,
) -> ApiResult<Json<StrategyResponse>> {
    if !ctx.admin {
        return Err(ApiError::Forbidden {
            request_id: None,
            reason: Some("strategy changes require an admin tenant".into()),
        });
    }
    let strategy = request
        .strategy
        .parse::<Strategy>()
        .map_err(|_| ApiError::NotFound { code: "unknown_strategy", request_id: None })?;
    state.lb.set_strategy(strategy);
    info!(strategy = strategy.as_str(), tenant_id = %ctx.tenant_id, "load balancing strategy changed");
    Ok(Json(StrategyResponse { strategy: strategy.as_str() }))
}
