//! Durable intent fingerprints
//!
//! A filled intent leaves no snapshot behind, so the fingerprint journal is
//! what lets a restarted process recognise a redelivered intent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::Result;

/// One remembered fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
}

#[async_trait]
pub trait FingerprintJournal: Send + Sync {
    /// Upsert; a later record for the same fingerprint replaces the earlier one
    async fn record(&self, record: &IdempotencyRecord) -> Result<()>;

    /// Records still live at `now`
    async fn live(&self, now: DateTime<Utc>) -> Result<Vec<IdempotencyRecord>>;

    /// Drop records expired at `now`, returning how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryFingerprintJournal {
    records: DashMap<String, IdempotencyRecord>,
}

impl MemoryFingerprintJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl FingerprintJournal for MemoryFingerprintJournal {
    async fn record(&self, record: &IdempotencyRecord) -> Result<()> {
        self.records
            .insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn live(&self, now: DateTime<Utc>) -> Result<Vec<IdempotencyRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.expiry_at > now)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, r| r.expiry_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

/// JSON-lines journal; the last line for a fingerprint wins
pub struct JsonlFingerprintJournal {
    path: PathBuf,
    writer: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlFingerprintJournal {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = Self::open_append(&path).await?;
        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(file),
        })
    }

    async fn open_append(path: &Path) -> Result<tokio::fs::File> {
        Ok(tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    /// Latest record per fingerprint, in file order of first appearance
    async fn read_latest(&self) -> Result<Vec<IdempotencyRecord>> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut order = Vec::new();
        let mut latest: HashMap<String, IdempotencyRecord> = HashMap::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            // A torn last line from a crash mid-write is skipped
            let record: IdempotencyRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping unreadable fingerprint line");
                    continue;
                }
            };
            if !latest.contains_key(&record.fingerprint) {
                order.push(record.fingerprint.clone());
            }
            latest.insert(record.fingerprint.clone(), record);
        }

        Ok(order
            .into_iter()
            .filter_map(|fp| latest.remove(&fp))
            .collect())
    }
}

#[async_trait]
impl FingerprintJournal for JsonlFingerprintJournal {
    async fn record(&self, record: &IdempotencyRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.writer.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn live(&self, now: DateTime<Utc>) -> Result<Vec<IdempotencyRecord>> {
        let _guard = self.writer.lock().await;
        let records = self.read_latest().await?;
        Ok(records.into_iter().filter(|r| r.expiry_at > now).collect())
    }

    /// Compacts the file: expired and superseded lines are dropped
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut writer = self.writer.lock().await;
        let records = self.read_latest().await?;
        let before = records.len();
        let live: Vec<_> = records.into_iter().filter(|r| r.expiry_at > now).collect();
        let kept = live.len();

        let mut body = Vec::new();
        for record in &live {
            body.extend(serde_json::to_vec(record)?);
            body.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        *writer = Self::open_append(&self.path).await?;

        let removed = before.saturating_sub(kept) as u64;
        debug!(removed, kept, "Fingerprint journal compacted");
        Ok(removed)
    }
}
