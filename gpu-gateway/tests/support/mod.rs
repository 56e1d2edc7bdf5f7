//! Shared harness: an AppState wired entirely to in-memory engines and stub
//! adapters so suites run without Postgres, Redis or network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, Response};
use axum::Router;
use common_audit::{AuditSink, MemoryAuditStore};
use common_auth::{generate_api_key, SessionCache, TokenConfig, TokenSigner, TokenVerifier};
use tower::ServiceExt;
use uuid::Uuid;

use gpu_gateway::app::build_router;
use gpu_gateway::app_state::AppState;
use gpu_gateway::auth::{Authenticator, InMemoryCredentialStore, TenantRecord};
use gpu_gateway::config::{BreakerConfig, GatewayConfig, RetryConfig};
use gpu_gateway::guardrails::{GuardRails, InMemorySpendStore, SPENDING_WINDOWS};
use gpu_gateway::inventory::GpuInventory;
use gpu_gateway::ip_access::{InMemoryPolicySource, IpAccessControl};
use gpu_gateway::load_balancer::{LoadBalancer, Strategy};
use gpu_gateway::metrics::GatewayMetrics;
use gpu_gateway::port_alloc::PortAllocator;
use gpu_gateway::providers::{GpuInstance, ProviderRegistry, StaticProvider};
use gpu_gateway::proxy::InferenceProxy;
use gpu_gateway::resilience::{BreakerRegistry, RetryPolicy};
use gpu_gateway::usage::UsageRecorder;

pub const TEST_CLIENT_IP: &str = "203.0.113.10";

pub fn instance(id: &str, vram: u32, price: f64) -> GpuInstance {
    GpuInstance {
        id: id.into(),
        provider: "selfhosted".into(),
        model_name: "A100".into(),
        gpu_count: 1,
        vram_gb: vram,
        cpu_cores: 16,
        ram_gb: 128,
        storage_gb: 512,
        price_per_hour: price,
        location: "us-east".into(),
        available: true,
        specifications: serde_json::Value::Null,
    }
}

pub struct HarnessBuilder {
    limits: Vec<(&'static str, f64)>,
    strategy: Strategy,
    instances: Vec<GpuInstance>,
    session_ttl: Duration,
    breaker: BreakerConfig,
    retry: RetryConfig,
    proxy_deadline: Duration,
    precheck_cost: f64,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            limits: Vec::new(),
            strategy: Strategy::RoundRobin,
            instances: vec![instance("a", 40, 1.0), instance("b", 40, 1.0)],
            session_ttl: Duration::from_secs(60),
            breaker: BreakerConfig {
                interval_secs: 60,
                timeout_secs: 30,
                min_requests: 10,
                failure_ratio: 0.6,
                half_open_max: 3,
                half_open_successes: 2,
            },
            retry: RetryConfig { max_attempts: 3, initial_ms: 1, cap_ms: 10 },
            proxy_deadline: Duration::from_secs(30),
            precheck_cost: 0.01,
        }
    }
}

impl HarnessBuilder {
    pub fn limits(mut self, limits: &[(&'static str, f64)]) -> Self {
        self.limits = limits.to_vec();
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn instances(mut self, instances: Vec<GpuInstance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn proxy_deadline(mut self, deadline: Duration) -> Self {
        self.proxy_deadline = deadline;
        self
    }

    pub fn build(self) -> Harness {
        let mut guardrail_limits = HashMap::new();
        for window in SPENDING_WINDOWS {
            guardrail_limits.insert(window.name, 0.0);
        }
        for (name, limit) in &self.limits {
            guardrail_limits.insert(*name, *limit);
        }
        let config = Arc::new(GatewayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: String::new(),
            redis_url: None,
            session_ttl_secs: self.session_ttl.as_secs().max(1),
            jwt_secret: "test-secret".into(),
            jwt_issuer: "gpu-gateway".into(),
            jwt_audience: "gpu-api".into(),
            lb_strategy: self.strategy,
            guardrail_limits,
            guardrails_precheck_cost: self.precheck_cost,
            breaker: self.breaker,
            retry: self.retry,
            proxy_deadline_secs: self.proxy_deadline.as_secs().max(1),
            audit_channel_capacity: 64,
            usage_flush_secs: 300,
            ip_rules_cache_secs: 0,
            provider_api_keys: HashMap::new(),
            grpc_tls_cert: None,
            grpc_tls_key: None,
        });

        let spend_store = Arc::new(InMemorySpendStore::new());
        let guardrails = GuardRails::new(spend_store, &self.limits);

        let token_config = TokenConfig::new("gpu-gateway", "gpu-api", "test-secret");
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let session_cache = SessionCache::new(self.session_ttl);
        let authenticator = Authenticator::new(
            credentials.clone(),
            session_cache.clone(),
            TokenVerifier::new(token_config.clone()),
        );
        let signer = TokenSigner::new(token_config);

        let audit_store = MemoryAuditStore::new();
        let audit_sink = AuditSink::spawn(audit_store.clone(), 64);
        let policies = Arc::new(InMemoryPolicySource::new());
        let ip_access = Arc::new(IpAccessControl::new(
            policies.clone(),
            Duration::from_secs(0),
            audit_sink.clone(),
        ));

        let lb = Arc::new(LoadBalancer::new(self.strategy));
        let ports = Arc::new(PortAllocator::new());
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider::new("selfhosted", self.instances)));
        let inventory = Arc::new(GpuInventory::new(registry, lb.clone(), ports));

        let usage = UsageRecorder::new(None, 300);
        let metrics = Arc::new(GatewayMetrics::new().expect("metrics registry"));
        let proxy = InferenceProxy::new(
            reqwest::Client::new(),
            lb.clone(),
            BreakerRegistry::new(self.breaker).with_metrics(metrics.clone()),
            guardrails.clone(),
            usage.clone(),
            metrics.clone(),
            RetryPolicy::from_config(self.retry),
            self.proxy_deadline,
        );

        let tenant = TenantRecord {
            id: Uuid::new_v4(),
            email: "tenant@example.com".into(),
            admin: false,
            active: true,
        };
        let api_key = generate_api_key();
        credentials.put_key(tenant.clone(), &api_key);

        let admin = TenantRecord {
            id: Uuid::new_v4(),
            email: "admin@example.com".into(),
            admin: true,
            active: true,
        };
        let admin_key = generate_api_key();
        credentials.put_key(admin.clone(), &admin_key);

        let state = AppState {
            config,
            pool: None,
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
        Harness {
            state,
            credentials,
            policies,
            audit_store,
            session_cache,
            tenant,
            api_key,
            admin,
            admin_key,
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub policies: Arc<InMemoryPolicySource>,
    pub audit_store: MemoryAuditStore,
    pub session_cache: SessionCache,
    pub tenant: TenantRecord,
    pub api_key: String,
    pub admin: TenantRecord,
    pub admin_key: String,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 41000))))
    }

    /// One-shot a request against a fresh router instance.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.expect("router call")
    }

    pub fn get(&self, path: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header("X-API-Key", &self.api_key)
            .header("X-Forwarded-For", TEST_CLIENT_IP)
            .body(Body::empty())
            .expect("request")
    }

    pub fn post_json(&self, path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("X-API-Key", &self.api_key)
            .header("X-Forwarded-For", TEST_CLIENT_IP)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub fn admin_json(&self, method: &str, path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("X-API-Key", &self.admin_key)
            .header("X-Forwarded-For", TEST_CLIENT_IP)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body bytes");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}
