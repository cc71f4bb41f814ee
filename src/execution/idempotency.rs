use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{IdempotencyConfig, MAX_IDEMPOTENCY_EXPIRY_SECS};
use crate::domain::{Intent, StateKey};
use crate::error::Result;
use crate::persistence::FingerprintJournal;

pub use crate::persistence::IdempotencyRecord;

/// Deduplication store for intents and FSM events
///
/// Intents are delivered at-least-once and exchange notifications can be
/// replayed, so every piece of work that mutates state is keyed by a
/// deterministic fingerprint and recorded here before it runs.
///
/// # How it works
/// 1. Build a fingerprint for the intent or event
/// 2. `check_and_record` atomically inserts it if absent (or expired)
/// 3. `true` means first occurrence: proceed
/// 4. `false` means duplicate: skip silently
///
/// Intent fingerprints go through `admit`, which also writes them to the
/// journal so they survive a restart; `reload` brings them back.
///
/// The expiry horizon must exceed the longest plausible delay between sending
/// an order and receiving its last fill notification. Too short and a late
/// notification is accepted as new; it is therefore configured explicitly.
pub struct IdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
    ttl: Duration,
    max_entries: usize,
    journal: Option<Arc<dyn FingerprintJournal>>,
}

impl IdempotencyStore {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::seconds(config.expiry_secs.min(MAX_IDEMPOTENCY_EXPIRY_SECS) as i64),
            max_entries: config.max_entries.max(1),
            journal: None,
        }
    }

    /// Persist intent fingerprints admitted through `admit`
    pub fn with_journal(mut self, journal: Arc<dyn FingerprintJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fingerprint for an intent delivery
    pub fn intent_fingerprint(intent: &Intent) -> String {
        format!("intent:{}", intent.intent_id)
    }

    /// Fingerprint for an FSM event within one key
    pub fn event_fingerprint(key: &StateKey, event_id: &str) -> String {
        format!("{}:{}:{}", key.symbol, key.side, event_id)
    }

    /// Returns true on first occurrence (proceed), false for a live duplicate.
    pub fn check_and_record(&self, fingerprint: &str) -> bool {
        self.check_and_record_at(fingerprint, Utc::now())
    }

    pub fn check_and_record_at(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.insert_at(fingerprint, now).is_some()
    }

    /// Record in memory, returning the new record on first occurrence
    fn insert_at(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        if self.records.len() >= self.max_entries && !self.records.contains_key(fingerprint) {
            self.evict(now);
        }

        let record = IdempotencyRecord {
            fingerprint: fingerprint.to_string(),
            first_seen_at: now,
            expiry_at: now + self.ttl,
        };

        match self.records.entry(fingerprint.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Some(record)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expiry_at <= now {
                    debug!(fingerprint, "Idempotency record expired, accepting as new");
                    slot.insert(record.clone());
                    Some(record)
                } else {
                    None
                }
            }
        }
    }

    /// Durable variant of `check_and_record`: the fingerprint is written to the
    /// journal before the caller proceeds. If the write fails the in-memory
    /// record is dropped again and the error returned.
    pub async fn admit(&self, fingerprint: &str) -> Result<bool> {
        let record = match self.insert_at(fingerprint, Utc::now()) {
            Some(record) => record,
            None => return Ok(false),
        };
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(&record).await {
                self.forget(fingerprint);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Load fingerprints still live in the journal, dropping expired ones there
    pub async fn reload(&self, now: DateTime<Utc>) -> Result<usize> {
        let journal = match &self.journal {
            Some(journal) => journal,
            None => return Ok(0),
        };

        let purged = journal.purge_expired(now).await?;
        let mut loaded = 0;
        for record in journal.live(now).await? {
            if record.expiry_at <= now {
                continue;
            }
            if self.records.len() >= self.max_entries && !self.records.contains_key(&record.fingerprint) {
                self.evict(now);
            }
            self.records.insert(record.fingerprint.clone(), record);
            loaded += 1;
        }
        info!(loaded, purged, "Reloaded intent fingerprints");
        Ok(loaded)
    }

    /// Whether a fingerprint is currently remembered
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.records
            .get(fingerprint)
            .map(|r| r.expiry_at > Utc::now())
            .unwrap_or(false)
    }

    /// Forget a fingerprint whose processing did not complete, so a retry of
    /// the same event is not mistaken for a duplicate.
    pub fn forget(&self, fingerprint: &str) {
        self.records.remove(fingerprint);
    }

    /// Remove expired records, returning how many were dropped
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expiry_at > now);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!("Purged {} expired idempotency records", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make room under the retention bound: expired first, then oldest.
    fn evict(&self, now: DateTime<Utc>) {
        self.purge_expired(now);
        if self.records.len() < self.max_entries {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .records
            .iter()
            .map(|r| (r.first_seen_at, r.key().clone()))
            .collect();
        by_age.sort();

        let excess = self.records.len() + 1 - self.max_entries;
        for (_, fingerprint) in by_age.into_iter().take(excess) {
            self.records.remove(&fingerprint);
        }
        warn!(
            evicted = excess,
            max_entries = self.max_entries,
            "Idempotency store at capacity, evicted oldest records"
        );
    }
}
