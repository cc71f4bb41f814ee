//! Snapshot storage
//!
//! One JSON snapshot per (symbol, side), written after every transition so a
//! crash can resume in-flight orders. Terminal snapshots are removed once they
//! carry no recovery value.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::{FsmState, StateKey};
use crate::error::{OrdexError, Result};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, state: &FsmState) -> Result<()>;

    async fn load(&self, key: &StateKey) -> Result<Option<FsmState>>;

    async fn delete(&self, key: &StateKey) -> Result<()>;

    /// Every stored snapshot, in key order
    async fn list(&self) -> Result<Vec<FsmState>>;
}

/// Process-local store, used for dry runs and tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    states: DashMap<StateKey, String>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, state: &FsmState) -> Result<()> {
        // Stored serialized so loads behave like a real round trip
        let json = serde_json::to_string(state)?;
        self.states.insert(state.key.clone(), json);
        Ok(())
    }

    async fn load(&self, key: &StateKey) -> Result<Option<FsmState>> {
        match self.states.get(key) {
            Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        self.states.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FsmState>> {
        let mut states = self
            .states
            .iter()
            .map(|entry| serde_json::from_str::<FsmState>(entry.value()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        states.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(states)
    }
}

/// One `<symbol>-<side>.json` file per key
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, state: &FsmState) -> Result<()> {
        let path = self.path_for(&state.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;

        // Write then rename, so a crash mid-write never leaves a torn snapshot
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(key = %state.key, version = state.version, "Snapshot written");
        Ok(())
    }

    async fn load(&self, key: &StateKey) -> Result<Option<FsmState>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &StateKey) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<FsmState>> {
        let mut states = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<FsmState>(&bytes) {
                Ok(state) => states.push(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable snapshot");
                    return Err(OrdexError::Snapshot(format!(
                        "unreadable snapshot {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        states.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(states)
    }
}
