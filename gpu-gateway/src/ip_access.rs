use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use common_audit::{AuditSink, IpAuditRecord, IpDecision, IpMatchType};
use ipnet::IpNet;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpMode {
    #[default]
    Disabled,
    Allowlist,
    Denylist,
    Strict,
}

impl FromStr for IpMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "disabled" => Ok(IpMode::Disabled),
            "allowlist" => Ok(IpMode::Allowlist),
            "denylist" => Ok(IpMode::Denylist),
            "strict" => Ok(IpMode::Strict),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpAccessConfig {
    pub mode: IpMode,
    pub allowlist_enabled: bool,
    pub denylist_enabled: bool,
    pub block_on_no_match: bool,
    pub audit_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleIp {
    Exact(IpAddr),
    Cidr(IpNet),
}

#[derive(Debug, Clone)]
pub struct IpRule {
    pub ip: RuleIp,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_by: Option<Uuid>,
}

impl IpRule {
    /// Expiry is evaluated at query time; expired rules are semantically
    /// inactive, never swept.
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    fn matches(&self, ip: IpAddr) -> Option<IpMatchType> {
        match &self.ip {
            RuleIp::Exact(rule_ip) if *rule_ip == ip => Some(IpMatchType::Exact),
            RuleIp::Cidr(net) if net.contains(&ip) => Some(IpMatchType::Cidr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TenantIpPolicy {
    pub config: IpAccessConfig,
    pub allow: Vec<IpRule>,
    pub deny: Vec<IpRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub match_type: IpMatchType,
    pub reason: Option<String>,
}

/// Where tenant policies come from. The gateway uses Postgres; tests use the
/// in-memory source.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `None` means no config row: access control disabled for the tenant.
    async fn load(&self, tenant_id: Uuid) -> Result<Option<TenantIpPolicy>>;
}

pub struct PgPolicySource {
    pool: PgPool,
}

impl PgPolicySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_rules(&self, tenant_id: Uuid, table: &str) -> Result<Vec<IpRule>> {
        let query = format!(
            "SELECT ip_address, cidr_range, is_active, expires_at, reason, created_by \
             FROM {table} WHERE tenant_id = $1"
        );
        let rows = sqlx::query(&query).bind(tenant_id).fetch_all(&self.pool).await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let exact: Option<String> = row.get("ip_address");
            let cidr: Option<String> = row.get("cidr_range");
            let ip = match (exact, cidr) {
                (Some(raw), _) => match raw.parse::<IpAddr>() {
                    Ok(ip) => RuleIp::Exact(ip),
                    Err(_) => {
                        warn!(%tenant_id, raw, "skipping unparseable ip rule");
                        continue;
                    }
                },
                (None, Some(raw)) => match raw.parse::<IpNet>() {
                    Ok(net) => RuleIp::Cidr(net),
                    Err(_) => {
                        warn!(%tenant_id, raw, "skipping unparseable cidr rule");
                        continue;
                    }
                },
                (None, None) => continue,
            };
            rules.push(IpRule {
                ip,
                active: row.get("is_active"),
                expires_at: row.get("expires_at"),
                reason: row.get("reason"),
                created_by: row.get("created_by"),
            });
        }
        Ok(rules)
    }
}

#[async_trait]
impl PolicySource for PgPolicySource {
    async fn load(&self, tenant_id: Uuid) -> Result<Option<TenantIpPolicy>> {
        let row = sqlx::query(
            "SELECT mode, allowlist_enabled, denylist_enabled, block_on_no_match, audit_enabled \
             FROM ip_access_config WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };

        let mode_raw: String = row.get("mode");
        let config = IpAccessConfig {
            mode: mode_raw.parse().unwrap_or_default(),
            allowlist_enabled: row.get("allowlist_enabled"),
            denylist_enabled: row.get("denylist_enabled"),
            block_on_no_match: row.get("block_on_no_match"),
            audit_enabled: row.get("audit_enabled"),
        };
        let allow = self.load_rules(tenant_id, "ip_allowlist").await?;
        let deny = self.load_rules(tenant_id, "ip_denylist").await?;
        Ok(Some(TenantIpPolicy { config, allow, deny }))
    }
}

/// Fixed policies, for tests.
#[derive(Default)]
pub struct InMemoryPolicySource {
    policies: std::sync::Mutex<HashMap<Uuid, TenantIpPolicy>>,
}

impl InMemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, tenant_id: Uuid, policy: TenantIpPolicy) {
        self.policies.lock().expect("mutex poisoned").insert(tenant_id, policy);
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn load(&self, tenant_id: Uuid) -> Result<Option<TenantIpPolicy>> {
        Ok(self.policies.lock().expect("mutex poisoned").get(&tenant_id).cloned())
    }
}

/// Per-tenant allow/deny evaluation with a short policy cache and an async
/// audit trail that never blocks the request path.
pub struct IpAccessControl {
    source: Arc<dyn PolicySource>,
    cache: RwLock<HashMap<Uuid, (Option<TenantIpPolicy>, Instant)>>,
    cache_ttl: Duration,
    audit: AuditSink,
}

impl IpAccessControl {
    pub fn new(source: Arc<dyn PolicySource>, cache_ttl: Duration, audit: AuditSink) -> Self {
        Self { source, cache: RwLock::new(HashMap::new()), cache_ttl, audit }
    }

    async fn policy(&self, tenant_id: Uuid) -> Result<Option<TenantIpPolicy>> {
        {
            let guard = self.cache.read().await;
            if let Some((policy, loaded_at)) = guard.get(&tenant_id) {
                if loaded_at.elapsed() < self.cache_ttl {
                    return Ok(policy.clone());
                }
            }
        }
        let policy = self.source.load(tenant_id).await?;
        let mut guard = self.cache.write().await;
        guard.insert(tenant_id, (policy.clone(), Instant::now()));
        Ok(policy)
    }

    pub async fn check(
        &self,
        tenant_id: Uuid,
        client_ip: IpAddr,
        endpoint: &str,
    ) -> Result<CheckOutcome> {
        let policy = self.policy(tenant_id).await?;
        let outcome = evaluate(policy.as_ref(), client_ip);

        let audit_enabled =
            policy.as_ref().map(|policy| policy.config.audit_enabled).unwrap_or(false);
        if audit_enabled {
            let decision = if outcome.allowed { IpDecision::Allow } else { IpDecision::Deny };
            self.audit.emit(IpAuditRecord::new(
                tenant_id,
                client_ip.to_string(),
                endpoint,
                decision,
                outcome.match_type,
                outcome.reason.clone(),
            ));
        }
        Ok(outcome)
    }
}

/// Denylist has absolute priority; allowlist no-match only blocks when the
/// tenant opted into that.
fn evaluate(policy: Option<&TenantIpPolicy>, ip: IpAddr) -> CheckOutcome {
    let Some(policy) = policy else {
        return CheckOutcome { allowed: true, match_type: IpMatchType::Disabled, reason: None };
    };
    let config = &policy.config;
    if config.mode == IpMode::Disabled {
        return CheckOutcome { allowed: true, match_type: IpMatchType::Disabled, reason: None };
    }
    let now = Utc::now();

    let deny_active = matches!(config.mode, IpMode::Denylist | IpMode::Strict)
        && config.denylist_enabled;
    if deny_active {
        if let Some((match_type, reason)) = match_rules(&policy.deny, ip, now) {
            return CheckOutcome { allowed: false, match_type, reason };
        }
    }

    let allow_active = matches!(config.mode, IpMode::Allowlist | IpMode::Strict)
        && config.allowlist_enabled;
    if allow_active {
        if let Some((match_type, reason)) = match_rules(&policy.allow, ip, now) {
            return CheckOutcome { allowed: true, match_type, reason };
        }
        let blocks = config.block_on_no_match || config.mode == IpMode::Strict;
        if blocks {
            return CheckOutcome {
                allowed: false,
                match_type: IpMatchType::None,
                reason: Some("ip not in allowlist".into()),
            };
        }
    }
    CheckOutcome { allowed: true, match_type: IpMatchType::None, reason: None }
}

/// Exact match wins over CIDR.
fn match_rules(
    rules: &[IpRule],
    ip: IpAddr,
    now: DateTime<Utc>,
) -> Option<(IpMatchType, Option<String>)> {
    let live = rules.iter().filter(|rule| rule.live(now));
    let mut cidr_hit = None;
    for rule in live {
        match rule.matches(ip) {
            Some(IpMatchType::Exact) => return Some((IpMatchType::Exact, rule.reason.clone())),
            Some(IpMatchType::Cidr) if cidr_hit.is_none() => {
                cidr_hit = Some((IpMatchType::Cidr, rule.reason.clone()));
            }
            _ => {}
        }
    }
    cidr_hit
}

/// First valid forwarded entry wins; the peer address is the last resort.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(raw) = headers.get("X-Forwarded-For").and_then(|value| value.to_str().ok()) {
        for entry in raw.split(',') {
            if let Ok(ip) = entry.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    for header in ["X-Real-IP", "CF-Connecting-IP"] {
        if let Some(ip) = headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.trim().parse::<IpAddr>().ok())
        {
            return Some(ip);
        }
    }
    peer.map(|addr| addr.ip())
}
