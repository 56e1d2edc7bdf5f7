use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Resolved identity cached against a credential fingerprint.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub tenant_id: Uuid,
    pub email: String,
    pub admin: bool,
    pub validated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Thread-safe credential-fingerprint -> tenant cache with a bounded TTL.
///
/// An entry is never served past its expiry. A credential revoked between
/// validation and expiry may still be admitted for at most the cache TTL;
/// that staleness bound is the documented consistency contract.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<RwLock<HashMap<String, SessionEntry>>>,
    ttl: chrono::Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn get(&self, fingerprint: &str) -> Option<SessionEntry> {
        let guard = self.inner.read().expect("rwlock poisoned");
        let entry = guard.get(fingerprint)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(&self, fingerprint: impl Into<String>, tenant_id: Uuid, email: String, admin: bool) {
        let now = Utc::now();
        let entry = SessionEntry {
            tenant_id,
            email,
            admin,
            validated_at: now,
            expires_at: now + self.ttl,
        };
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.insert(fingerprint.into(), entry);
    }

    /// Cap an entry's lifetime below the cache TTL (e.g. to a token's own expiry).
    pub fn insert_until(
        &self,
        fingerprint: impl Into<String>,
        tenant_id: Uuid,
        email: String,
        admin: bool,
        not_after: DateTime<Utc>,
    ) {
        let now = Utc::now();
        let entry = SessionEntry {
            tenant_id,
            email,
            admin,
            validated_at: now,
            expires_at: (now + self.ttl).min(not_after),
        };
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.insert(fingerprint.into(), entry);
    }

    pub fn invalidate(&self, fingerprint: &str) {
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.remove(fingerprint);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
