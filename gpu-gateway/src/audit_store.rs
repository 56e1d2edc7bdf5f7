use async_trait::async_trait;
use common_audit::{AuditError, AuditResult, AuditStore, IpAuditRecord, IpDecision};
use sqlx::PgPool;

/// Appender for the `ip_access_log` table. The table is append-only; schema
/// ownership lies outside the gateway.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, record: &IpAuditRecord) -> AuditResult<()> {
        let decision = match record.decision {
            IpDecision::Allow => "allow",
            IpDecision::Deny => "deny",
        };
        sqlx::query(
            "INSERT INTO ip_access_log \
             (id, tenant_id, client_ip, endpoint, decision, match_type, reason, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(&record.client_ip)
        .bind(&record.endpoint)
        .bind(decision)
        .bind(record.match_type.as_str())
        .bind(&record.reason)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|err| AuditError::Store(err.to_string()))?;
        Ok(())
    }
}
