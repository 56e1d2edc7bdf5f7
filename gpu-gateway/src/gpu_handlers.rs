use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::app_state::AppState;
use crate::auth::TenantCtxExtractor;
use crate::inventory::{
    InstanceFilter, InventoryError, ProviderFailure, Reservation, ReserveOutcome, SlotError,
    MAX_BATCH_PER_PROVIDER,
};
use crate::providers::{CreateConfig, GpuInstance, ProviderError};
use crate::proxy::{ForwardRequest, ProxyError, ProxyPayload};

fn map_inventory_error(err: InventoryError) -> ApiError {
    match err {
        InventoryError::BadCount { .. } => ApiError::Malformed {
            code: "bad_count",
            request_id: None,
            message: Some(err.to_string()),
        },
        InventoryError::NoCandidates => ApiError::NotFound { code: "no_matching_instances", request_id: None },
        InventoryError::Provider(provider_err) => map_provider_error(provider_err),
    }
}

fn map_provider_error(err: ProviderError) -> ApiError {
    match err {
        ProviderError::UnknownProvider(_) => {
            ApiError::NotFound { code: "unknown_provider", request_id: None }
        }
        ProviderError::UnknownInstance(_) => {
            ApiError::NotFound { code: "unknown_instance", request_id: None }
        }
        ProviderError::Unavailable(_) => ApiError::Conflict {
            code: "instance_unavailable",
            request_id: None,
            message: Some(err.to_string()),
        },
        ProviderError::InvalidConfig(message) => ApiError::Malformed {
            code: "invalid_config",
            request_id: None,
            message: Some(message),
        },
        ProviderError::Upstream(message) => {
            ApiError::UpstreamFailure { request_id: None, message: Some(message) }
        }
    }
}

fn map_proxy_error(err: ProxyError) -> ApiError {
    match err {
        ProxyError::BadRequest(message) => ApiError::Malformed {
            code: "bad_proxy_request",
            request_id: None,
            message: Some(message),
        },
        ProxyError::NoCapacity => ApiError::UpstreamFailure {
            request_id: None,
            message: Some("no backend capacity for the request".into()),
        },
        ProxyError::CircuitOpen { retry_after } => ApiError::CircuitOpen {
            request_id: None,
            retry_after_secs: retry_after.as_secs().max(1),
        },
        ProxyError::Upstream(message) => {
            ApiError::UpstreamFailure { request_id: None, message: Some(message) }
        }
        ProxyError::Timeout => ApiError::Timeout { request_id: None },
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub min_vram: Option<u32>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub gpu_model: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub instances: Vec<GpuInstance>,
    pub count: usize,
    pub errors: Vec<ProviderFailure>,
}

pub async fn list_instances(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let outcome = state
        .inventory
        .list(query.provider.as_deref())
        .await
        .map_err(map_inventory_error)?;
    let filter = InstanceFilter {
        min_vram: query.min_vram,
        max_price: query.max_price,
        gpu_model: query.gpu_model,
        location: query.location,
    };
    let instances = crate::inventory::GpuInventory::filter(outcome.instances, &filter);
    Ok(Json(ListResponse { count: instances.len(), instances, errors: outcome.errors }))
}

#[derive(Serialize)]
pub struct CreateResponse {
    pub provider: String,
    pub instance_id: String,
    pub contract_id: String,
}

pub async fn create_instance(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
    Path((provider, instance_id)): Path<(String, String)>,
    Json(config): Json<CreateConfig>,
) -> ApiResult<Json<CreateResponse>> {
    config.validate().map_err(map_provider_error)?;
    let contract_id = state
        .inventory
        .create(&provider, &instance_id, &config)
        .await
        .map_err(map_inventory_error)?;
    Ok(Json(CreateResponse { provider, instance_id, contract_id }))
}

pub async fn destroy_instance(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
    Path((provider, instance_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .inventory
        .destroy(&provider, &instance_id)
        .await
        .map_err(map_inventory_error)?;
    Ok(Json(serde_json::json!({ "destroyed": instance_id, "provider": provider })))
}

#[derive(Deserialize)]
pub struct BatchCreateRequest {
    #[serde(default)]
    pub vastai_count: usize,
    #[serde(default)]
    pub ionet_count: usize,
    #[serde(default)]
    pub config: CreateConfig,
}

#[derive(Serialize)]
pub struct BatchCreateResponse {
    pub reservations: Vec<Reservation>,
    pub errors: HashMap<String, Vec<SlotError>>,
}

pub async fn batch_create(
    State(state): State<AppState>,
    TenantCtxExtractor(_ctx): TenantCtxExtractor,
    Json(request): Json<BatchCreateRequest>,
) -> ApiResult<Json<BatchCreateResponse>> {
    for (provider, count) in
        [("vastai", request.vastai_count), ("ionet", request.ionet_count)]
    {
        if count > MAX_BATCH_PER_PROVIDER {
            return Err(ApiError::Malformed {
                code: "bad_count",
                request_id: None,
                message: Some(format!(
                    "{provider} count must be within 0..={MAX_BATCH_PER_PROVIDER}, got {count}"
                )),
            });
        }
    }
    let mut reservations = Vec::new();
    let mut errors = HashMap::new();
    for (provider, count) in
        [("vastai", request.vastai_count), ("ionet", request.ionet_count)]
    {
        if count == 0 {
            continue;
        }
        match state.inventory.bulk_create(provider, count, &request.config).await {
            Ok(mut outcome) => {
                reservations.append(&mut outcome.reservations);
                if !outcome.errors.is_empty() {
                    errors.insert(provider.to_string(), outcome.errors);
                }
            }
            Err(err) => {
                warn!(provider, ?err, "batch create failed for provider");
                errors.insert(
                    provider.to_string(),
                    vec![SlotError { slot: 0, message: err.to_string() }],
                );
            }
        }
    }
    Ok(Json(BatchCreateResponse { reservations, errors }))
}

#[derive(Deserialize)]
pub struct ReserveRequest {
    pub count: usize,
    #[serde(default)]
    pub filters: InstanceFilter,
    #[serde(default)]
    pub config: CreateConfig,
}

#[derive(Serialize)]
pub struct ReserveResponse {
    pub count: usize,
    #[serde(flatten)]
    pub outcome: ReserveOutcome,
}

pub async fn reserve_instances(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Json(request): Json<ReserveRequest>,
) -> ApiResult<Json<ReserveResponse>> {
    let outcome = state
        .inventory
        .reserve(ctx.tenant_id, request.count, &request.filters, &request.config)
        .await
        .map_err(map_inventory_error)?;
    Ok(Json(ReserveResponse { count: outcome.reservations.len(), outcome }))
}

async fn proxy_candidates(state: &AppState) -> ApiResult<Vec<GpuInstance>> {
    let listed = state.inventory.list(None).await.map_err(map_inventory_error)?;
    Ok(listed.instances.into_iter().filter(|instance| instance.available).collect())
}

/// Unary proxy: http/https/openinference. WebSocket protocols must arrive as
/// an upgrade on GET.
pub async fn proxy_unary(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Json(payload): Json<ProxyPayload>,
) -> ApiResult<Response> {
    let request = ForwardRequest::from_payload(payload).map_err(map_proxy_error)?;
    if request.protocol.is_websocket() {
        return Err(ApiError::Malformed {
            code: "upgrade_required",
            request_id: None,
            message: Some("websocket protocols require an upgraded GET request".into()),
        });
    }
    let candidates = proxy_candidates(&state).await?;
    let instance = state
        .proxy
        .select_instance(&request, &candidates)
        .map_err(map_proxy_error)?;
    let response = state
        .proxy
        .forward(ctx.tenant_id, request, instance)
        .await
        .map_err(map_proxy_error)?;
    Ok(response.into_axum_response())
}

#[derive(Deserialize)]
pub struct ProxyUpgradeQuery {
    #[serde(default = "default_ws_protocol")]
    pub protocol: String,
    pub target_url: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_ws_protocol() -> String {
    "ws".to_string()
}

pub async fn proxy_upgrade(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
    Query(query): Query<ProxyUpgradeQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let request = ForwardRequest::from_payload(ProxyPayload {
        protocol: query.protocol,
        target_url: query.target_url,
        method: None,
        headers: HashMap::new(),
        body: None,
        instance_id: query.instance_id,
    })
    .map_err(map_proxy_error)?;
    if !request.protocol.is_websocket() {
        return Err(ApiError::Malformed {
            code: "not_a_websocket_protocol",
            request_id: None,
            message: Some(format!("protocol {:?} is unary", request.protocol)),
        });
    }
    let candidates = proxy_candidates(&state).await?;
    let instance = state
        .proxy
        .select_instance(&request, &candidates)
        .map_err(map_proxy_error)?;
    let proxy = state.proxy.clone();
    let tenant_id = ctx.tenant_id;
    Ok(ws.on_upgrade(move |socket| async move {
        proxy.bridge_websocket(tenant_id, socket, request, instance).await;
    }))
}
