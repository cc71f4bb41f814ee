//! Persistence layer for crash recovery and audit
//!
//! - Snapshot stores: one FSM state per (symbol, side), memory / file / postgres
//! - Audit logs: append-only trail per intent, memory / JSON lines / postgres
//! - Fingerprint journals: intent fingerprints that outlive filled snapshots

pub mod audit;
pub mod fingerprints;
pub mod postgres;
pub mod snapshot;

use std::sync::Arc;
use tracing::info;

pub use audit::{AuditEntry, AuditLog, AuditRecord, Decision, JsonlAuditLog, MemoryAuditLog};
pub use fingerprints::{
    FingerprintJournal, IdempotencyRecord, JsonlFingerprintJournal, MemoryFingerprintJournal,
};
pub use postgres::{PostgresAuditLog, PostgresFingerprintJournal, PostgresSnapshotStore};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::error::{OrdexError, Result};

/// Stores opened for one backend
#[derive(Clone)]
pub struct Backends {
    pub snapshots: Arc<dyn SnapshotStore>,
    pub audit: Arc<dyn AuditLog>,
    pub fingerprints: Arc<dyn FingerprintJournal>,
}

/// Open every store for the configured backend
pub async fn open(config: &PersistenceConfig) -> Result<Backends> {
    info!(backend = ?config.backend, "Opening persistence backend");
    match config.backend {
        PersistenceBackend::Memory => Ok(Backends {
            snapshots: Arc::new(MemorySnapshotStore::new()),
            audit: Arc::new(MemoryAuditLog::new()),
            fingerprints: Arc::new(MemoryFingerprintJournal::new()),
        }),
        PersistenceBackend::File => Ok(Backends {
            snapshots: Arc::new(FileSnapshotStore::open(&config.snapshot_dir).await?),
            audit: Arc::new(JsonlAuditLog::open(&config.audit_path).await?),
            fingerprints: Arc::new(JsonlFingerprintJournal::open(&config.fingerprint_path).await?),
        }),
        PersistenceBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                OrdexError::Validation("persistence.database_url is not set".to_string())
            })?;
            let pool = postgres::connect(url, config.max_connections).await?;
            Ok(Backends {
                snapshots: Arc::new(PostgresSnapshotStore::from_pool(pool.clone())),
                audit: Arc::new(PostgresAuditLog::from_pool(pool.clone())),
                fingerprints: Arc::new(PostgresFingerprintJournal::from_pool(pool)),
            })
        }
    }
}
