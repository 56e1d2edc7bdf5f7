use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;

use crate::guardrails::SPENDING_WINDOWS;
use crate::load_balancer::Strategy;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub session_ttl_secs: u64,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub lb_strategy: Strategy,
    /// USD limit per window name; only entries > 0 are active.
    pub guardrail_limits: HashMap<&'static str, f64>,
    pub guardrails_precheck_cost: f64,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub proxy_deadline_secs: u64,
    pub audit_channel_capacity: usize,
    pub usage_flush_secs: u64,
    pub ip_rules_cache_secs: u64,
    pub provider_api_keys: HashMap<String, String>,
    pub grpc_tls_cert: Option<String>,
    pub grpc_tls_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub min_requests: u64,
    pub failure_ratio: f64,
    pub half_open_max: u32,
    pub half_open_successes: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub cap_ms: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|value| value.parse::<T>().ok()).unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env::var("REDIS_URL").ok();
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "gpu-gateway".to_string());
        let jwt_audience = env::var("JWT_AUDIENCE").unwrap_or_else(|_| "gpu-api".to_string());

        let lb_strategy = match env::var("LB_STRATEGY") {
            Ok(raw) => raw
                .parse::<Strategy>()
                .map_err(|_| anyhow::anyhow!("unknown LB_STRATEGY '{raw}'"))?,
            Err(_) => Strategy::RoundRobin,
        };

        let mut guardrail_limits = HashMap::new();
        for window in SPENDING_WINDOWS {
            let key = format!("GUARDRAILS_MAX_{}_RATE", window.name.to_uppercase());
            let limit = env_parse::<f64>(&key, 0.0);
            if limit < 0.0 {
                bail!("{key} must be >= 0");
            }
            guardrail_limits.insert(window.name, limit);
        }

        let breaker = BreakerConfig {
            interval_secs: env_parse("BREAKER_INTERVAL_SECONDS", 60),
            timeout_secs: env_parse("BREAKER_TIMEOUT_SECONDS", 30),
            min_requests: env_parse("BREAKER_MIN_REQUESTS", 10),
            failure_ratio: env_parse("BREAKER_FAILURE_RATIO", 0.6),
            half_open_max: env_parse("BREAKER_HALF_OPEN_MAX", 3),
            half_open_successes: env_parse("BREAKER_HALF_OPEN_SUCCESSES", 2),
        };
        let retry = RetryConfig {
            max_attempts: env_parse("PROXY_RETRY_MAX_ATTEMPTS", 3),
            initial_ms: env_parse("PROXY_RETRY_INITIAL_MS", 100),
            cap_ms: env_parse("PROXY_RETRY_CAP_MS", 10_000),
        };

        let mut provider_api_keys = HashMap::new();
        if let Ok(key) = env::var("VASTAI_API_KEY") {
            provider_api_keys.insert("vastai".to_string(), key);
        }
        if let Ok(key) = env::var("IONET_API_KEY") {
            provider_api_keys.insert("ionet".to_string(), key);
        }

        let grpc_tls_cert = env::var("GRPC_TLS_CERT").ok();
        let grpc_tls_key = env::var("GRPC_TLS_KEY").ok();
        for (name, path) in [("GRPC_TLS_CERT", &grpc_tls_cert), ("GRPC_TLS_KEY", &grpc_tls_key)] {
            if let Some(path) = path {
                if !std::path::Path::new(path).exists() {
                    bail!("{name} points to a missing file: {path}");
                }
            }
        }
        if grpc_tls_cert.is_some() != grpc_tls_key.is_some() {
            bail!("GRPC_TLS_CERT and GRPC_TLS_KEY must be set together");
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8080),
            database_url,
            redis_url,
            session_ttl_secs: env_parse("SESSION_TTL", 60u64).max(1),
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            lb_strategy,
            guardrail_limits,
            guardrails_precheck_cost: env_parse("GUARDRAILS_PRECHECK_COST", 0.01),
            breaker,
            retry,
            proxy_deadline_secs: env_parse("PROXY_DEADLINE_SECONDS", 300u64).max(1),
            audit_channel_capacity: env_parse("AUDIT_CHANNEL_CAPACITY", 1024usize).max(1),
            usage_flush_secs: env_parse("USAGE_FLUSH_SECONDS", 300u64).max(10),
            ip_rules_cache_secs: env_parse("IP_RULES_CACHE_SECONDS", 30u64),
            provider_api_keys,
            grpc_tls_cert,
            grpc_tls_key,
        })
    }

    /// Active windows with their configured USD limits.
    pub fn active_limits(&self) -> Vec<(&'static str, f64)> {
        let mut active: Vec<(&'static str, f64)> = self
            .guardrail_limits
            .iter()
            .filter(|(_, limit)| **limit > 0.0)
            .map(|(name, limit)| (*name, *limit))
            .collect();
        active.sort_by_key(|(name, _)| {
            SPENDING_WINDOWS.iter().position(|w| w.name == *name).unwrap_or(usize::MAX)
        });
        active
    }
}
