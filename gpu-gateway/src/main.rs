use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_audit::AuditSink;
use common_auth::{SessionCache, TokenConfig, TokenSigner, TokenVerifier};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use gpu_gateway::app::build_router;
use gpu_gateway::app_state::AppState;
use gpu_gateway::audit_store::PgAuditStore;
use gpu_gateway::auth::{Authenticator, PgCredentialStore};
use gpu_gateway::config::GatewayConfig;
use gpu_gateway::guardrails::{GuardRails, InMemorySpendStore, RedisSpendStore, SpendStore};
use gpu_gateway::inventory::GpuInventory;
use gpu_gateway::ip_access::{IpAccessControl, PgPolicySource};
use gpu_gateway::load_balancer::LoadBalancer;
use gpu_gateway::metrics::GatewayMetrics;
use gpu_gateway::port_alloc::PortAllocator;
use gpu_gateway::providers::{GpuInstance, ProviderRegistry, StaticProvider};
use gpu_gateway::proxy::InferenceProxy;
use gpu_gateway::resilience::{BreakerRegistry, RetryPolicy};
use gpu_gateway::usage::UsageRecorder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to persistent store")?;

    let spend_store: Arc<dyn SpendStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisSpendStore::new(url).await?),
        None => {
            warn!("REDIS_URL not set; spending counters are process-local");
            Arc::new(InMemorySpendStore::new())
        }
    };
    let limits: Vec<(&'static str, f64)> = config.active_limits();
    let guardrails = GuardRails::new(spend_store, &limits);
    if guardrails.enabled() {
        info!(windows = limits.len(), "guard rails active");
    } else {
        info!("guard rails disabled (no window has a limit > 0)");
    }

    let token_config = TokenConfig::new(
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        config.jwt_secret.clone(),
    )
    .with_access_ttl(3600);
    let session_cache = SessionCache::new(Duration::from_secs(config.session_ttl_secs));
    let authenticator = Authenticator::new(
        Arc::new(PgCredentialStore::new(pool.clone())),
        session_cache.clone(),
        TokenVerifier::new(token_config.clone()),
    );
    let signer = TokenSigner::new(token_config);
    spawn_session_purge(session_cache);

    let audit_sink =
        AuditSink::spawn(PgAuditStore::new(pool.clone()), config.audit_channel_capacity);
    let ip_access = Arc::new(IpAccessControl::new(
        Arc::new(PgPolicySource::new(pool.clone())),
        Duration::from_secs(config.ip_rules_cache_secs),
        audit_sink.clone(),
    ));

    let lb = Arc::new(LoadBalancer::new(config.lb_strategy));
    let ports = Arc::new(PortAllocator::new());
    let registry = build_provider_registry()?;
    if registry.tags().is_empty() {
        warn!("no provider adapters registered; listings will be empty");
    }
    let inventory = Arc::new(GpuInventory::new(registry, lb.clone(), ports));

    let usage = UsageRecorder::new(Some(pool.clone()), config.usage_flush_secs);
    usage.spawn_background_flush();

    let metrics = Arc::new(GatewayMetrics::new()?);
    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let proxy = InferenceProxy::new(
        http_client,
        lb.clone(),
        BreakerRegistry::new(config.breaker).with_metrics(metrics.clone()),
        guardrails.clone(),
        usage.clone(),
        metrics.clone(),
        RetryPolicy::from_config(config.retry),
        Duration::from_secs(config.proxy_deadline_secs),
    );

    let state = AppState {
        config: config.clone(),
        pool: Some(pool),
        authenticator,
        signer,
        ip_access,
        guardrails,
        lb,
        inventory,
        proxy,
        usage,
        audit_sink,
        metrics,
    };
    let app = build_router(state);

    let ip: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::from((ip, config.port));
    info!(%addr, strategy = config.lb_strategy.as_str(), "starting gpu-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// Self-hosted backends are declared up front; rented-vendor adapters are
/// separate crates that register here when deployed.
fn build_provider_registry() -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    if let Ok(raw) = env::var("SELF_HOSTED_INSTANCES") {
        let instances: Vec<GpuInstance> = serde_json::from_str(&raw)
            .context("SELF_HOSTED_INSTANCES must be a JSON array of instances")?;
        info!(count = instances.len(), "registered self-hosted instances");
        registry.register(Arc::new(StaticProvider::new("selfhosted", instances)));
    }
    Ok(registry)
}

fn spawn_session_purge(cache: SessionCache) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired session cache entries");
            }
        }
    });
}
