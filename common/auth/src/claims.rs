use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

/// Application-focused representation of a verified bearer-token payload.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub tenant_id: Uuid,
    pub email: String,
    pub admin: bool,
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub issuer: String,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|value| value == scope)
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    scope: Vec<String>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    iss: String,
}

impl TryFrom<ClaimsRepr> for Claims {
    type Error = AuthError;

    fn try_from(value: ClaimsRepr) -> AuthResult<Self> {
        let tenant_id = Uuid::parse_str(&value.sub)
            .map_err(|_| AuthError::InvalidClaim("sub", value.sub.clone()))?;

        let expires_at = Utc
            .timestamp_opt(value.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidClaim("exp", value.exp.to_string()))?;

        let issued_at = match value.iat {
            Some(iat) => Some(
                Utc.timestamp_opt(iat, 0)
                    .single()
                    .ok_or_else(|| AuthError::InvalidClaim("iat", iat.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            tenant_id,
            email: value.email,
            admin: value.admin,
            scope: value.scope,
            expires_at,
            issued_at,
            issuer: value.iss,
        })
    }
}

impl TryFrom<serde_json::Value> for Claims {
    type Error = AuthError;

    fn try_from(value: serde_json::Value) -> AuthResult<Self> {
        let repr: ClaimsRepr = serde_json::from_value(value)
            .map_err(|err| AuthError::InvalidJson(err.to_string()))?;
        Claims::try_from(repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_full_payload() {
        let tenant = Uuid::new_v4();
        let value = json!({
            "sub": tenant.to_string(),
            "email": "ops@example.com",
            "admin": true,
            "scope": ["proxy", "reserve"],
            "exp": 4_102_444_800i64,
            "iat": 1_700_000_000i64,
            "iss": "gpu-gateway",
            "aud": "gpu-api",
        });
        let claims = Claims::try_from(value).unwrap();
        assert_eq!(claims.tenant_id, tenant);
        assert!(claims.admin);
        assert!(claims.has_scope("proxy"));
    }

    #[test]
    fn rejects_non_uuid_subject() {
        let value = json!({
            "sub": "not-a-uuid",
            "exp": 4_102_444_800i64,
            "iss": "gpu-gateway",
        });
        let err = Claims::try_from(value).unwrap_err();
        assert!(matches!(err, AuthError::InvalidClaim("sub", _)));
    }
}
