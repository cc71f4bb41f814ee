use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::{AuditLog, AuditRecord, FingerprintJournal, IdempotencyRecord, SnapshotStore};
use crate::domain::{FsmState, StateKey};
use crate::error::{OrdexError, Result};

/// Connect and run migrations. All postgres stores share the returned pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations completed");
    Ok(pool)
}

/// Snapshots upserted by (symbol, side)
#[derive(Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(skip(self, state), fields(key = %state.key))]
    async fn save(&self, state: &FsmState) -> Result<()> {
        let payload = serde_json::to_value(state)?;

        sqlx::query(
            r#"
            INSERT INTO execution_snapshots (symbol, side, phase, version, state, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (symbol, side) DO UPDATE SET
                phase = EXCLUDED.phase,
                version = EXCLUDED.version,
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(&state.key.symbol)
        .bind(state.key.side.as_str())
        .bind(state.phase.as_str())
        .bind(state.version as i64)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        debug!(version = state.version, "Snapshot upserted");
        Ok(())
    }

    async fn load(&self, key: &StateKey) -> Result<Option<FsmState>> {
        let row = sqlx::query(
            r#"
            SELECT state FROM execution_snapshots
            WHERE symbol = $1 AND side = $2
            "#,
        )
        .bind(&key.symbol)
        .bind(key.side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.get("state");
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        sqlx::query("DELETE FROM execution_snapshots WHERE symbol = $1 AND side = $2")
            .bind(&key.symbol)
            .bind(key.side.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FsmState>> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM execution_snapshots
            ORDER BY symbol ASC, side ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FsmState> {
                let payload: serde_json::Value = row.get("state");
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }
}

/// Append-only audit table
#[derive(Clone)]
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PostgresAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let entry = serde_json::to_value(&record.entry)?;

        sqlx::query(
            r#"
            INSERT INTO execution_audit (id, intent_id, symbol, side, kind, entry, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.intent_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.kind())
        .bind(&entry)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn by_intent(&self, intent_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, intent_id, symbol, side, entry, recorded_at
            FROM execution_audit
            WHERE intent_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AuditRecord> {
                let side: String = row.get("side");
                let entry: serde_json::Value = row.get("entry");
                Ok(AuditRecord {
                    id: row.get("id"),
                    intent_id: row.get("intent_id"),
                    symbol: row.get("symbol"),
                    side: side.parse().map_err(|e: &str| {
                        OrdexError::Snapshot(format!("bad side in audit row: {}", e))
                    })?,
                    entry: serde_json::from_value(entry)?,
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }
}

/// Intent fingerprints keyed by fingerprint
#[derive(Clone)]
pub struct PostgresFingerprintJournal {
    pool: PgPool,
}

impl PostgresFingerprintJournal {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintJournal for PostgresFingerprintJournal {
    async fn record(&self, record: &IdempotencyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_intents (fingerprint, first_seen_at, expiry_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (fingerprint) DO UPDATE SET
                first_seen_at = EXCLUDED.first_seen_at,
                expiry_at = EXCLUDED.expiry_at
            "#,
        )
        .bind(&record.fingerprint)
        .bind(record.first_seen_at)
        .bind(record.expiry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn live(&self, now: DateTime<Utc>) -> Result<Vec<IdempotencyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint, first_seen_at, expiry_at
            FROM execution_intents
            WHERE expiry_at > $1
            ORDER BY first_seen_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IdempotencyRecord {
                fingerprint: row.get("fingerprint"),
                first_seen_at: row.get("first_seen_at"),
                expiry_at: row.get("expiry_at"),
            })
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_intents WHERE expiry_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
