//! Append-only audit trail keyed by intent id
//!
//! The engine writes one record per applied transition; the router adds
//! records for decisions that do not move the state machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{EventKind, OrderPhase, Side, StateKey};
use crate::error::{OrdexError, Result};

/// Decisions the router records without a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    DuplicateIgnored,
    KillSwitch,
    InvalidIntent,
    NoPrice,
    KeyBusy,
    ReserveFailed,
    Backoff,
    StaleStateReset,
    Recovered,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::DuplicateIgnored => "duplicate_ignored",
            Decision::KillSwitch => "kill_switch",
            Decision::InvalidIntent => "invalid_intent",
            Decision::NoPrice => "no_price",
            Decision::KeyBusy => "key_busy",
            Decision::ReserveFailed => "reserve_failed",
            Decision::Backoff => "backoff",
            Decision::StaleStateReset => "stale_state_reset",
            Decision::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Transition {
        from: OrderPhase,
        to: OrderPhase,
        event: EventKind,
        event_id: String,
    },
    Decision {
        decision: Decision,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub intent_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub entry: AuditEntry,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn transition(
        key: &StateKey,
        intent_id: Option<&str>,
        from: OrderPhase,
        to: OrderPhase,
        event: EventKind,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id: intent_id.map(str::to_string),
            symbol: key.symbol.clone(),
            side: key.side,
            entry: AuditEntry::Transition {
                from,
                to,
                event,
                event_id: event_id.to_string(),
            },
            recorded_at: at,
        }
    }

    pub fn decision(
        key: &StateKey,
        intent_id: Option<&str>,
        decision: Decision,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id: intent_id.map(str::to_string),
            symbol: key.symbol.clone(),
            side: key.side,
            entry: AuditEntry::Decision { decision, detail },
            recorded_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.entry {
            AuditEntry::Transition { .. } => "transition",
            AuditEntry::Decision { .. } => "decision",
        }
    }
}

impl std::fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f");
        match &self.entry {
            AuditEntry::Transition {
                from,
                to,
                event,
                event_id,
            } => write!(
                f,
                "{} {}:{} {} -> {} on {} ({})",
                ts, self.symbol, self.side, from, to, event, event_id
            ),
            AuditEntry::Decision { decision, detail } => write!(
                f,
                "{} {}:{} decision={} {}",
                ts,
                self.symbol,
                self.side,
                decision.as_str(),
                detail.as_deref().unwrap_or("")
            ),
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;

    /// Records for one intent in append order
    async fn by_intent(&self, intent_id: &str) -> Result<Vec<AuditRecord>>;
}

#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| OrdexError::Internal("audit log lock poisoned".to_string()))?
            .push(record);
        Ok(())
    }

    async fn by_intent(&self, intent_id: &str) -> Result<Vec<AuditRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| OrdexError::Internal("audit log lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .filter(|r| r.intent_id.as_deref() == Some(intent_id))
            .cloned()
            .collect())
    }
}

/// JSON-lines file, one record per line
pub struct JsonlAuditLog {
    path: PathBuf,
    writer: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.writer.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn by_intent(&self, intent_id: &str) -> Result<Vec<AuditRecord>> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;
            if record.intent_id.as_deref() == Some(intent_id) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
