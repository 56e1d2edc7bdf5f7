use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::model::{AuditResult, IpAuditRecord};

/// Persistence behind the sink. Implementations append a single record;
/// batching is the writer task's concern.
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    async fn append(&self, record: &IpAuditRecord) -> AuditResult<()>;
}

/// Store that discards everything. Used when auditing is disabled.
pub struct NoopAuditStore;

#[async_trait]
impl AuditStore for NoopAuditStore {
    async fn append(&self, _record: &IpAuditRecord) -> AuditResult<()> {
        Ok(())
    }
}

/// In-memory store for tests; records can be drained and asserted on.
#[derive(Default, Clone)]
pub struct MemoryAuditStore {
    records: Arc<Mutex<Vec<IpAuditRecord>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<IpAuditRecord> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        guard.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &IpAuditRecord) -> AuditResult<()> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        guard.push(record.clone());
        Ok(())
    }
}

/// Fire-and-forget audit sink: a bounded channel drained by a background
/// writer. `emit` never blocks the request path; when the channel is full the
/// record is dropped and counted instead of queued unboundedly.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<IpAuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    pub fn spawn<S: AuditStore>(store: S, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<IpAuditRecord>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = store.append(&record).await {
                    warn!(?err, tenant_id = %record.tenant_id, "failed to persist audit record");
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn emit(&self, record: IpAuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(tenant_id = %record.tenant_id, "audit channel full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(tenant_id = %record.tenant_id, "audit writer gone, dropping record");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
