use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use common_http_errors::SpendViolation;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendingWindow {
    pub name: &'static str,
    pub duration: Duration,
}

const fn minutes(count: u64) -> Duration {
    Duration::from_secs(count * 60)
}

const fn hours(count: u64) -> Duration {
    Duration::from_secs(count * 3600)
}

/// The 17 sliding horizons, 5 minutes to 72 hours. A window participates in
/// admission iff its configured limit is > 0.
pub const SPENDING_WINDOWS: &[SpendingWindow] = &[
    SpendingWindow { name: "5min", duration: minutes(5) },
    SpendingWindow { name: "10min", duration: minutes(10) },
    SpendingWindow { name: "15min", duration: minutes(15) },
    SpendingWindow { name: "30min", duration: minutes(30) },
    SpendingWindow { name: "45min", duration: minutes(45) },
    SpendingWindow { name: "60min", duration: minutes(60) },
    SpendingWindow { name: "2h", duration: hours(2) },
    SpendingWindow { name: "3h", duration: hours(3) },
    SpendingWindow { name: "4h", duration: hours(4) },
    SpendingWindow { name: "6h", duration: hours(6) },
    SpendingWindow { name: "8h", duration: hours(8) },
    SpendingWindow { name: "12h", duration: hours(12) },
    SpendingWindow { name: "18h", duration: hours(18) },
    SpendingWindow { name: "24h", duration: hours(24) },
    SpendingWindow { name: "36h", duration: hours(36) },
    SpendingWindow { name: "48h", duration: hours(48) },
    SpendingWindow { name: "72h", duration: hours(72) },
];

pub fn window_by_name(name: &str) -> Option<&'static SpendingWindow> {
    SPENDING_WINDOWS.iter().find(|window| window.name == name)
}

/// Storage for per-(tenant, window) running sums. The add must be atomic with
/// its TTL refresh per window; cross-window atomicity is not required.
#[async_trait]
pub trait SpendStore: Send + Sync {
    async fn fetch(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<f64>;
    async fn add(&self, tenant_id: Uuid, window: &SpendingWindow, amount: f64) -> Result<f64>;
    async fn reset(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<()>;
    /// Liveness probe for /health.
    async fn ping(&self) -> Result<()>;
}

fn counter_key(tenant_id: Uuid, window: &SpendingWindow) -> String {
    format!("guardrails:{}:{}", tenant_id, window.name)
}

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisSpendStore {
    manager: ConnectionManager,
}

impl RedisSpendStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl SpendStore for RedisSpendStore {
    async fn fetch(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<f64> {
        let mut conn = self.manager.clone();
        let value: Option<f64> = redis::cmd("GET")
            .arg(counter_key(tenant_id, window))
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0.0))
    }

    async fn add(&self, tenant_id: Uuid, window: &SpendingWindow, amount: f64) -> Result<f64> {
        let key = counter_key(tenant_id, window);
        let mut conn = self.manager.clone();
        // MULTI/EXEC keeps the increment and TTL refresh a single atomic unit.
        let (current,): (f64,) = redis::pipe()
            .atomic()
            .cmd("INCRBYFLOAT")
            .arg(&key)
            .arg(amount)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(window.duration.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(current)
    }

    async fn reset(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(counter_key(tenant_id, window))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// ---------------- In-Memory Implementation (tests, single-node) ----------------

#[derive(Default)]
pub struct InMemorySpendStore {
    inner: Mutex<HashMap<String, (f64, Instant)>>,
}

impl InMemorySpendStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpendStore for InMemorySpendStore {
    async fn fetch(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<f64> {
        let guard = self.inner.lock().await;
        Ok(match guard.get(&counter_key(tenant_id, window)) {
            Some((sum, deadline)) if *deadline > Instant::now() => *sum,
            _ => 0.0,
        })
    }

    async fn add(&self, tenant_id: Uuid, window: &SpendingWindow, amount: f64) -> Result<f64> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard
            .entry(counter_key(tenant_id, window))
            .or_insert((0.0, now + window.duration));
        if entry.1 <= now {
            *entry = (0.0, now + window.duration);
        }
        entry.0 += amount;
        entry.1 = now + window.duration;
        Ok(entry.0)
    }

    async fn reset(&self, tenant_id: Uuid, window: &SpendingWindow) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.remove(&counter_key(tenant_id, window));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------- GuardRails ----------------

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub violations: Vec<SpendViolation>,
    /// Running sum per active window, keyed by window name.
    pub spent: HashMap<&'static str, f64>,
}

/// Multi-horizon spending guard. Admission is conservative: any single active
/// window breach denies.
#[derive(Clone)]
pub struct GuardRails {
    store: Arc<dyn SpendStore>,
    /// Active (window, USD limit) pairs, limit > 0.
    limits: Vec<(&'static SpendingWindow, f64)>,
}

impl GuardRails {
    pub fn new(store: Arc<dyn SpendStore>, limits: &[(&'static str, f64)]) -> Self {
        let limits = limits
            .iter()
            .filter(|(_, limit)| *limit > 0.0)
            .filter_map(|(name, limit)| window_by_name(name).map(|window| (window, *limit)))
            .collect();
        Self { store, limits }
    }

    pub fn enabled(&self) -> bool {
        !self.limits.is_empty()
    }

    pub fn active_windows(&self) -> impl Iterator<Item = (&'static SpendingWindow, f64)> + '_ {
        self.limits.iter().copied()
    }

    pub fn store(&self) -> &Arc<dyn SpendStore> {
        &self.store
    }

    pub async fn check(&self, tenant_id: Uuid, estimated_cost: f64) -> Result<CheckOutcome> {
        let mut violations = Vec::new();
        let mut spent = HashMap::new();
        for (window, limit) in &self.limits {
            let sum = self.store.fetch(tenant_id, window).await?;
            spent.insert(window.name, sum);
            if sum + estimated_cost > *limit {
                violations.push(SpendViolation {
                    window: window.name.to_string(),
                    spent: sum,
                    estimated: estimated_cost,
                    limit: *limit,
                });
            }
        }
        Ok(CheckOutcome { allowed: violations.is_empty(), violations, spent })
    }

    /// Post-call accounting. Best-effort: one retry per window, then the
    /// drift is logged and accepted.
    pub async fn record(&self, tenant_id: Uuid, actual_cost: f64) {
        if actual_cost <= 0.0 {
            return;
        }
        for (window, _) in &self.limits {
            let mut result = self.store.add(tenant_id, window, actual_cost).await;
            if result.is_err() {
                result = self.store.add(tenant_id, window, actual_cost).await;
            }
            if let Err(err) = result {
                warn!(%tenant_id, window = window.name, ?err, "failed to record spend");
            }
        }
    }

    pub async fn reset(&self, tenant_id: Uuid, window_name: Option<&str>) -> Result<usize> {
        match window_name {
            Some(name) => {
                let window =
                    window_by_name(name).with_context(|| format!("unknown window '{name}'"))?;
                self.store.reset(tenant_id, window).await?;
                Ok(1)
            }
            None => {
                for window in SPENDING_WINDOWS {
                    self.store.reset(tenant_id, window).await?;
                }
                Ok(SPENDING_WINDOWS.len())
            }
        }
    }
}
