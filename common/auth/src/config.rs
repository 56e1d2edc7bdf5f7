/// Runtime configuration for bearer-token signing and verification.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Expected issuer claim (iss).
    pub issuer: String,
    /// Expected audience claim (aud).
    pub audience: String,
    /// Shared HS256 signing secret.
    pub secret: String,
    /// Lifetime of issued access tokens.
    pub access_ttl_seconds: i64,
    /// Allowable clock skew in seconds when validating exp/nbf.
    pub leeway_seconds: u32,
}

impl TokenConfig {
    /// Construct config with sensible defaults (1 hour tokens, 30 second leeway).
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            secret: secret.into(),
            access_ttl_seconds: 3600,
            leeway_seconds: 30,
        }
    }

    pub fn with_access_ttl(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }
}
