use anyhow::Result;
use axum::response::Response;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    auth_failures: IntCounterVec,
    ip_denials: IntCounterVec,
    guardrail_violations: IntCounterVec,
    lb_picks: IntCounterVec,
    proxy_retries: IntCounter,
    breaker_transitions: IntCounterVec,
    proxy_latency: Histogram,
    active_connections: IntGauge,
    audit_dropped: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests grouped by outcome"),
            &["outcome"],
        )?;
        let auth_failures = IntCounterVec::new(
            Opts::new("gateway_auth_failures_total", "Authentication failures by cause"),
            &["cause"],
        )?;
        let ip_denials = IntCounterVec::new(
            Opts::new("gateway_ip_denials_total", "IP access denials by match type"),
            &["match_type"],
        )?;
        let guardrail_violations = IntCounterVec::new(
            Opts::new("gateway_guardrail_violations_total", "Guard-rail violations by window"),
            &["window"],
        )?;
        let lb_picks = IntCounterVec::new(
            Opts::new("gateway_lb_picks_total", "Load balancer picks by strategy"),
            &["strategy"],
        )?;
        let proxy_retries = IntCounter::new(
            "gateway_proxy_retries_total",
            "Retried proxy attempts",
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("gateway_breaker_transitions_total", "Circuit breaker transitions by state"),
            &["state"],
        )?;
        let proxy_latency = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_proxy_latency_seconds",
                "Wall time of proxied backend calls (seconds)",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let active_connections = IntGauge::with_opts(Opts::new(
            "gateway_active_backend_connections",
            "Currently dispatched backend connections",
        ))?;
        let audit_dropped = IntGauge::with_opts(Opts::new(
            "gateway_audit_dropped_total",
            "Audit records dropped due to channel backpressure",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(ip_denials.clone()))?;
        registry.register(Box::new(guardrail_violations.clone()))?;
        registry.register(Box::new(lb_picks.clone()))?;
        registry.register(Box::new(proxy_retries.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(proxy_latency.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(audit_dropped.clone()))?;
        common_observability::register_build_info(
            &registry,
            "gpu-gateway",
            env!("CARGO_PKG_VERSION"),
        )?;

        Ok(Self {
            registry,
            requests,
            auth_failures,
            ip_denials,
            guardrail_violations,
            lb_picks,
            proxy_retries,
            breaker_transitions,
            proxy_latency,
            active_connections,
            audit_dropped,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_auth_failure(&self, cause: &str) {
        self.auth_failures.with_label_values(&[cause]).inc();
    }

    pub fn record_ip_denial(&self, match_type: &str) {
        self.ip_denials.with_label_values(&[match_type]).inc();
    }

    pub fn record_guardrail_violation(&self, window: &str) {
        self.guardrail_violations.with_label_values(&[window]).inc();
    }

    pub fn record_lb_pick(&self, strategy: &str) {
        self.lb_picks.with_label_values(&[strategy]).inc();
    }

    pub fn record_proxy_retry(&self) {
        self.proxy_retries.inc();
    }

    pub fn record_breaker_transition(&self, state: &str) {
        self.breaker_transitions.with_label_values(&[state]).inc();
    }

    pub fn observe_proxy_latency(&self, secs: f64) {
        self.proxy_latency.observe(secs);
    }

    pub fn connection_dispatched(&self) {
        self.active_connections.inc();
    }

    pub fn connection_released(&self) {
        self.active_connections.dec();
    }

    pub fn set_audit_dropped(&self, dropped: u64) {
        self.audit_dropped.set(dropped as i64);
    }

    pub fn render(&self) -> Result<Response> {
        common_observability::render_registry(&self.registry)
    }
}
