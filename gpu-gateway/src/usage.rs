use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

/// Buffered per-(tenant, instance) usage accumulation, flushed to the
/// append-only `gpu_usage` table on an interval. The billing ledger itself is
/// owned elsewhere; the gateway only appends raw usage.
#[derive(Clone)]
pub struct UsageRecorder {
    inner: Arc<UsageRecorderInner>,
}

struct UsageRecorderInner {
    pool: Option<PgPool>,
    flush_secs: u64,
    data: Mutex<HashMap<(Uuid, String), UsageRecord>>,
}

struct UsageRecord {
    tenant_id: Uuid,
    provider: String,
    instance_id: String,
    window_start: DateTime<Utc>,
    seconds: f64,
    cost: f64,
}

impl UsageRecorder {
    pub fn new(pool: Option<PgPool>, flush_secs: u64) -> Self {
        Self {
            inner: Arc::new(UsageRecorderInner {
                pool,
                flush_secs,
                data: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn spawn_background_flush(&self) {
        let recorder = self.clone();
        let flush_interval = Duration::from_secs(self.inner.flush_secs);
        tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = recorder.flush().await {
                    warn!(?err, "failed to flush gpu usage window");
                }
            }
        });
    }

    pub async fn record(
        &self,
        tenant_id: Uuid,
        provider: &str,
        instance_id: &str,
        seconds: f64,
        cost: f64,
    ) {
        let mut guard = self.inner.data.lock().await;
        let entry = guard
            .entry((tenant_id, instance_id.to_string()))
            .or_insert_with(|| UsageRecord {
                tenant_id,
                provider: provider.to_string(),
                instance_id: instance_id.to_string(),
                window_start: Utc::now(),
                seconds: 0.0,
                cost: 0.0,
            });
        entry.seconds += seconds;
        entry.cost += cost;
    }

    pub async fn pending(&self) -> usize {
        self.inner.data.lock().await.len()
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut drained: Vec<((Uuid, String), UsageRecord)> = {
            let mut guard = self.inner.data.lock().await;
            guard.drain().collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        let Some(pool) = &self.inner.pool else { return Ok(()) };
        while let Some((key, record)) = drained.pop() {
            let inserted = sqlx::query(
                "INSERT INTO gpu_usage \
                 (tenant_id, provider, instance_id, seconds, cost, window_start, window_end) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(record.tenant_id)
            .bind(&record.provider)
            .bind(&record.instance_id)
            .bind(record.seconds)
            .bind(record.cost)
            .bind(record.window_start)
            .bind(now)
            .execute(pool)
            .await;
            if let Err(err) = inserted {
                // Unflushed records go back into the map so the next tick
                // retries them instead of losing the usage.
                let mut guard = self.inner.data.lock().await;
                requeue(&mut guard, key, record);
                for (key, record) in drained {
                    requeue(&mut guard, key, record);
                }
                return Err(err.into());
            }
        }
        Ok(())
    }
}

/// Merge an unflushed record back in; accumulation that happened during the
/// flush attempt is preserved.
fn requeue(
    map: &mut HashMap<(Uuid, String), UsageRecord>,
    key: (Uuid, String),
    record: UsageRecord,
) {
    use std::collections::hash_map::Entry;
    match map.entry(key) {
        Entry::Occupied(mut entry) => {
            let existing = entry.get_mut();
            existing.seconds += record.seconds;
            existing.cost += record.cost;
            existing.window_start = existing.window_start.min(record.window_start);
        }
        Entry::Vacant(slot) => {
            slot.insert(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_accumulate_per_tenant_instance() {
        let recorder = UsageRecorder::new(None, 300);
        let tenant = Uuid::new_v4();
        recorder.record(tenant, "static", "a", 10.0, 0.01).await;
        recorder.record(tenant, "static", "a", 5.0, 0.005).await;
        recorder.record(tenant, "static", "b", 1.0, 0.001).await;
        assert_eq!(recorder.pending().await, 2);
    }

    #[tokio::test]
    async fn flush_without_pool_drains_quietly() {
        let recorder = UsageRecorder::new(None, 300);
        recorder.record(Uuid::new_v4(), "static", "a", 10.0, 0.01).await;
        recorder.flush().await.unwrap();
        assert_eq!(recorder.pending().await, 0);
    }

    #[test]
    fn requeue_merges_with_fresh_accumulation() {
        let tenant = Uuid::new_v4();
        let key = (tenant, "a".to_string());
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        let mut map = HashMap::new();
        map.insert(
            key.clone(),
            UsageRecord {
                tenant_id: tenant,
                provider: "static".into(),
                instance_id: "a".into(),
                window_start: Utc::now(),
                seconds: 2.0,
                cost: 0.002,
            },
        );

        requeue(
            &mut map,
            key.clone(),
            UsageRecord {
                tenant_id: tenant,
                provider: "static".into(),
                instance_id: "a".into(),
                window_start: earlier,
                seconds: 10.0,
                cost: 0.01,
            },
        );

        let merged = &map[&key];
        assert_eq!(merged.seconds, 12.0);
        assert_eq!(merged.cost, 0.012);
        assert_eq!(merged.window_start, earlier, "keeps the oldest window start");

        let other = (tenant, "b".to_string());
        requeue(
            &mut map,
            other.clone(),
            UsageRecord {
                tenant_id: tenant,
                provider: "static".into(),
                instance_id: "b".into(),
                window_start: earlier,
                seconds: 1.0,
                cost: 0.001,
            },
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map[&other].seconds, 1.0);
    }
}
