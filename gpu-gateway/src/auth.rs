use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use common_auth::{
    fingerprint_api_key, hash_api_key, AuthError, SessionCache, TokenVerifier,
};
use common_http_errors::ApiError;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::app_state::AppState;

/// Immutable per-request identity. Inserted into request extensions by the
/// auth middleware; everything downstream reads it from there.
#[derive(Debug, Clone)]
pub struct TenantCtx {
    pub tenant_id: Uuid,
    pub email: String,
    pub admin: bool,
    pub auth_method: &'static str,
}

pub struct TenantCtxExtractor(pub TenantCtx);

#[async_trait]
impl<S> FromRequestParts<S> for TenantCtxExtractor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantCtx>()
            .cloned()
            .map(TenantCtxExtractor)
            .ok_or(ApiError::Unauthenticated { request_id: None })
    }
}

#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub id: Uuid,
    pub email: String,
    pub admin: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub tenant: TenantRecord,
    pub salt: String,
    pub salted_hash: String,
    pub status: KeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persistence behind the authenticator. Keys are addressed by their
/// unsalted fingerprint; the salted hash is verified after the row loads.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve_api_key(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, AuthError>;
    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantRecord>, AuthError>;
    /// Best-effort; failures must not affect the request.
    async fn touch_key_last_used(&self, key_id: Uuid) -> Result<(), AuthError>;
    async fn insert_api_key(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        salt: &str,
        salted_hash: &str,
    ) -> Result<Uuid, AuthError>;
}

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_err(err: sqlx::Error) -> AuthError {
    AuthError::Storage(err.to_string())
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn resolve_api_key(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, AuthError> {
        let row = sqlx::query(
            "SELECT k.id, k.key_salt, k.key_hash, k.status, k.expires_at, \
                    u.id AS tenant_id, u.email, u.is_admin, u.is_active \
             FROM api_keys k JOIN tenants u ON u.id = k.tenant_id \
             WHERE k.lookup_hash = $1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        let Some(row) = row else { return Ok(None) };
        let status: String = row.get("status");
        Ok(Some(ApiKeyRecord {
            id: row.get("id"),
            tenant: TenantRecord {
                id: row.get("tenant_id"),
                email: row.get("email"),
                admin: row.get("is_admin"),
                active: row.get("is_active"),
            },
            salt: row.get("key_salt"),
            salted_hash: row.get("key_hash"),
            status: if status == "revoked" { KeyStatus::Revoked } else { KeyStatus::Active },
            expires_at: row.get("expires_at"),
        }))
    }

    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantRecord>, AuthError> {
        let row = sqlx::query("SELECT id, email, is_admin, is_active FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| TenantRecord {
            id: row.get("id"),
            email: row.get("email"),
            admin: row.get("is_admin"),
            active: row.get("is_active"),
        }))
    }

    async fn touch_key_last_used(&self, key_id: Uuid) -> Result<(), AuthError> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn insert_api_key(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        salt: &str,
        salted_hash: &str,
    ) -> Result<Uuid, AuthError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, lookup_hash, key_salt, key_hash, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, 'active', NOW())",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(fingerprint)
        .bind(salt)
        .bind(salted_hash)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(id)
    }
}

/// Fixed credential set, for tests and local bring-up.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    keys: std::sync::Mutex<HashMap<String, ApiKeyRecord>>,
    tenants: std::sync::Mutex<HashMap<Uuid, TenantRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_tenant(&self, tenant: TenantRecord) {
        self.tenants.lock().expect("mutex poisoned").insert(tenant.id, tenant);
    }

    /// Register a plaintext key for a tenant and return it.
    pub fn put_key(&self, tenant: TenantRecord, plaintext: &str) {
        let salt = Uuid::new_v4().to_string();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            salt: salt.clone(),
            salted_hash: hash_api_key(&salt, plaintext),
            status: KeyStatus::Active,
            expires_at: None,
        };
        self.put_tenant(tenant);
        self.keys
            .lock()
            .expect("mutex poisoned")
            .insert(fingerprint_api_key(plaintext), record);
    }

    pub fn revoke_key(&self, plaintext: &str) {
        let mut guard = self.keys.lock().expect("mutex poisoned");
        if let Some(record) = guard.get_mut(&fingerprint_api_key(plaintext)) {
            record.status = KeyStatus::Revoked;
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn resolve_api_key(&self, fingerprint: &str) -> Result<Option<ApiKeyRecord>, AuthError> {
        Ok(self.keys.lock().expect("mutex poisoned").get(fingerprint).cloned())
    }

    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantRecord>, AuthError> {
        Ok(self.tenants.lock().expect("mutex poisoned").get(&tenant_id).cloned())
    }

    async fn touch_key_last_used(&self, _key_id: Uuid) -> Result<(), AuthError> {
        Ok(())
    }

    async fn insert_api_key(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        salt: &str,
        salted_hash: &str,
    ) -> Result<Uuid, AuthError> {
        let tenant = self
            .tenant_by_id(tenant_id)
            .await?
            .ok_or(AuthError::TenantInactive)?;
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            tenant,
            salt: salt.to_string(),
            salted_hash: salted_hash.to_string(),
            status: KeyStatus::Active,
            expires_at: None,
        };
        let id = record.id;
        self.keys.lock().expect("mutex poisoned").insert(fingerprint.to_string(), record);
        Ok(id)
    }
}

/// API-key / bearer-token resolution with the session cache in front of the
/// credential store.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    cache: SessionCache,
    verifier: TokenVerifier,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, cache: SessionCache, verifier: TokenVerifier) -> Self {
        Self { store, cache, verifier }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn identify(&self, headers: &HeaderMap) -> Result<TenantCtx, AuthError> {
        if let Some(key) = headers.get("X-API-Key").and_then(|value| value.to_str().ok()) {
            return self.identify_api_key(key.trim()).await;
        }
        if let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        {
            return self.identify_bearer(token).await;
        }
        Err(AuthError::MissingCredential)
    }

    pub async fn identify_api_key(&self, key: &str) -> Result<TenantCtx, AuthError> {
        if key.is_empty() {
            return Err(AuthError::MalformedCredential);
        }
        let fingerprint = fingerprint_api_key(key);
        if let Some(entry) = self.cache.get(&fingerprint) {
            return Ok(TenantCtx {
                tenant_id: entry.tenant_id,
                email: entry.email,
                admin: entry.admin,
                auth_method: "api_key",
            });
        }

        let record = self
            .store
            .resolve_api_key(&fingerprint)
            .await?
            .ok_or(AuthError::UnknownKey)?;
        if hash_api_key(&record.salt, key) != record.salted_hash {
            return Err(AuthError::UnknownKey);
        }
        if record.status == KeyStatus::Revoked {
            return Err(AuthError::RevokedKey);
        }
        if record.expires_at.map(|at| at <= Utc::now()).unwrap_or(false) {
            return Err(AuthError::ExpiredKey);
        }
        if !record.tenant.active {
            return Err(AuthError::TenantInactive);
        }

        self.cache.insert(
            fingerprint,
            record.tenant.id,
            record.tenant.email.clone(),
            record.tenant.admin,
        );
        // last_used_at is informational; its write never gates admission.
        let store = self.store.clone();
        let key_id = record.id;
        tokio::spawn(async move {
            if let Err(err) = store.touch_key_last_used(key_id).await {
                warn!(%key_id, ?err, "failed to update key last_used_at");
            }
        });

        Ok(TenantCtx {
            tenant_id: record.tenant.id,
            email: record.tenant.email,
            admin: record.tenant.admin,
            auth_method: "api_key",
        })
    }

    async fn identify_bearer(&self, token: &str) -> Result<TenantCtx, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MalformedCredential);
        }
        let claims = self.verifier.verify(token)?;
        if let Some(entry) = self.cache.get(token) {
            return Ok(TenantCtx {
                tenant_id: entry.tenant_id,
                email: entry.email,
                admin: entry.admin,
                auth_method: "bearer",
            });
        }

        let tenant = self
            .store
            .tenant_by_id(claims.tenant_id)
            .await?
            .ok_or_else(|| AuthError::InvalidToken("token subject unknown".into()))?;
        if !tenant.active {
            return Err(AuthError::TenantInactive);
        }
        self.cache.insert_until(
            token,
            tenant.id,
            tenant.email.clone(),
            tenant.admin,
            claims.expires_at,
        );
        Ok(TenantCtx {
            tenant_id: tenant.id,
            email: tenant.email,
            admin: tenant.admin,
            auth_method: "bearer",
        })
    }
}

fn failure_cause(err: &AuthError) -> &'static str {
    match err {
        AuthError::MissingCredential => "missing",
        AuthError::MalformedCredential => "malformed",
        AuthError::InvalidToken(_) | AuthError::InvalidClaim(_, _) | AuthError::InvalidJson(_) => {
            "invalid_token"
        }
        AuthError::ExpiredToken => "expired_token",
        AuthError::UnknownKey => "unknown_key",
        AuthError::RevokedKey => "revoked_key",
        AuthError::ExpiredKey => "expired_key",
        AuthError::TenantInactive => "tenant_inactive",
        AuthError::Storage(_) => "storage",
    }
}

/// Paths that opt out of identification.
pub fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/metrics" | "/api/v1/auth/login")
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if is_public_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }
    let ctx = match state.authenticator.identify(request.headers()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            let cause = failure_cause(&err);
            state.metrics.record_auth_failure(cause);
            warn!(error = %err, cause, "authentication failed");
            return Err(ApiError::Unauthenticated { request_id: None });
        }
    };
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
