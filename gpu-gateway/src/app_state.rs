use std::sync::Arc;

use common_audit::AuditSink;
use sqlx::PgPool;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::guardrails::GuardRails;
use crate::inventory::GpuInventory;
use crate::ip_access::IpAccessControl;
use crate::load_balancer::LoadBalancer;
use crate::metrics::GatewayMetrics;
use crate::proxy::InferenceProxy;
use crate::usage::UsageRecorder;
use common_auth::TokenSigner;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Absent when running against in-memory stores (tests, local bring-up).
    pub pool: Option<PgPool>,
    pub authenticator: Authenticator,
    pub signer: TokenSigner,
    pub ip_access: Arc<IpAccessControl>,
    pub guardrails: GuardRails,
    pub lb: Arc<LoadBalancer>,
    pub inventory: Arc<GpuInventory>,
    pub proxy: InferenceProxy,
    pub usage: UsageRecorder,
    pub audit_sink: AuditSink,
    pub metrics: Arc<GatewayMetrics>,
}
