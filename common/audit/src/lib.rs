pub mod model;
pub mod sink;

pub use model::{AuditError, AuditResult, IpAuditRecord, IpDecision, IpMatchType};
pub use sink::{AuditSink, AuditStore, MemoryAuditStore, NoopAuditStore};
