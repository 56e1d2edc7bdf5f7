use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::claims::Claims;
use crate::config::TokenConfig;
use crate::error::AuthResult;

/// Identity material a token is minted for.
pub struct TokenSubject {
    pub tenant_id: Uuid,
    pub email: String,
    pub admin: bool,
    pub scope: Vec<String>,
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
    pub token_type: &'static str,
}

#[derive(Serialize)]
struct ClaimsOut<'a> {
    sub: String,
    email: &'a str,
    admin: bool,
    scope: &'a [String],
    iat: i64,
    exp: i64,
    iss: &'a str,
    aud: &'a str,
}

#[derive(Clone)]
pub struct TokenSigner {
    config: TokenConfig,
    encoding_key: EncodingKey,
}

impl TokenSigner {
    pub fn new(config: TokenConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        Self { config, encoding_key }
    }

    pub fn issue(&self, subject: &TokenSubject) -> AuthResult<IssuedToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.access_ttl_seconds);
        let claims = ClaimsOut {
            sub: subject.tenant_id.to_string(),
            email: &subject.email,
            admin: subject.admin,
            scope: &subject.scope,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: &self.config.issuer,
            aud: &self.config.audience,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        debug!(tenant_id = %subject.tenant_id, "issued bearer token");
        Ok(IssuedToken {
            token,
            expires_at,
            expires_in: self.config.access_ttl_seconds,
            token_type: "Bearer",
        })
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    config: TokenConfig,
    decoding_key: DecodingKey,
}

impl TokenVerifier {
    pub fn new(config: TokenConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self { config, decoding_key }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.clone()]);
        validation.set_audience(&[self.config.audience.clone()]);
        validation.leeway = self.config.leeway_seconds.into();

        let token_data = decode::<Value>(token, &self.decoding_key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(tenant_id = %claims.tenant_id, "verified bearer token");
        Ok(claims)
    }
}
