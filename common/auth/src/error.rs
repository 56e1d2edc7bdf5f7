use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

/// Causes are distinguished for logs; clients only ever see a single 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential material in request")]
    MissingCredential,
    #[error("credential material malformed")]
    MalformedCredential,
    #[error("token verification failed: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    ExpiredToken,
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("api key does not resolve to a credential")]
    UnknownKey,
    #[error("api key revoked")]
    RevokedKey,
    #[error("api key expired")]
    ExpiredKey,
    #[error("tenant is deactivated")]
    TenantInactive,
    #[error("credential store lookup failed: {0}")]
    Storage(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match value.kind() {
            ErrorKind::ExpiredSignature => Self::ExpiredToken,
            _ => Self::InvalidToken(value.to_string()),
        }
    }
}
