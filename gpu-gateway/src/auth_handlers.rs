use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use common_auth::{fingerprint_api_key, generate_api_key, hash_api_key, TokenSubject};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::TenantCtxExtractor;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub api_key: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
}

/// Exchange an API key for a bearer token. Registration and passwords live
/// outside the gateway; the key is the only credential it can verify.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let ctx = state
        .authenticator
        .identify_api_key(request.api_key.trim())
        .await
        .map_err(|err| {
            warn!(error = %err, "login rejected");
            ApiError::Unauthenticated { request_id: None }
        })?;

    let issued = state
        .signer
        .issue(&TokenSubject {
            tenant_id: ctx.tenant_id,
            email: ctx.email.clone(),
            admin: ctx.admin,
            scope: vec!["proxy".to_string(), "reserve".to_string()],
        })
        .map_err(|err| ApiError::internal(err, None))?;

    info!(tenant_id = %ctx.tenant_id, "issued bearer token via login");
    Ok(Json(LoginResponse {
        access_token: issued.token,
        token_type: issued.token_type,
        expires_in: issued.expires_in,
        expires_at: issued.expires_at,
    }))
}

#[derive(Serialize)]
pub struct IssueKeyResponse {
    pub key_id: Uuid,
    /// Shown exactly once; only the salted hash is stored.
    pub api_key: String,
}

pub async fn issue_api_key(
    State(state): State<AppState>,
    TenantCtxExtractor(ctx): TenantCtxExtractor,
) -> ApiResult<Json<IssueKeyResponse>> {
    let plaintext = generate_api_key();
    let salt = Uuid::new_v4().to_string();
    let salted_hash = hash_api_key(&salt, &plaintext);
    let fingerprint = fingerprint_api_key(&plaintext);

    let key_id = state
        .authenticator
        .store()
        .insert_api_key(ctx.tenant_id, &fingerprint, &salt, &salted_hash)
        .await
        .map_err(|err| ApiError::internal(err, None))?;

    info!(tenant_id = %ctx.tenant_id, %key_id, "issued api key");
    Ok(Json(IssueKeyResponse { key_id, api_key: plaintext }))
}
