use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMatchType {
    Exact,
    Cidr,
    None,
    Disabled,
}

impl IpMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpMatchType::Exact => "exact",
            IpMatchType::Cidr => "cidr",
            IpMatchType::None => "none",
            IpMatchType::Disabled => "disabled",
        }
    }
}

/// Append-only row describing one allow/deny decision for an (IP, tenant, endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAuditRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub client_ip: String,
    pub endpoint: String,
    pub decision: IpDecision,
    pub match_type: IpMatchType,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl IpAuditRecord {
    pub fn new(
        tenant_id: Uuid,
        client_ip: impl Into<String>,
        endpoint: impl Into<String>,
        decision: IpDecision,
        match_type: IpMatchType,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            client_ip: client_ip.into(),
            endpoint: endpoint.into(),
            decision,
            match_type,
            reason,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store append failed: {0}")]
    Store(String),
    #[error("audit sink closed")]
    Closed,
}

pub type AuditResult<T> = Result<T, AuditError>;
