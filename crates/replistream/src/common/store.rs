//! Persisted engine state
//!
//! A small key/value persistence seam injected into each component — no
//! ambient global property map. Keys are namespaced by slave or master
//! identifier. Two implementations ship with the engine: an in-memory store
//! for tests and a file-backed store that survives process restarts.

use crate::common::{ReplError, Result};
use crate::slave::SlaveStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Namespaced key/value persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Per-slave state that must survive a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSlaveState {
    /// Admission status at shutdown
    pub status: SlaveStatus,
    /// Highest sequence seen so far (redelivery watermark)
    pub max_sequence: u64,
    /// Whether outbound delivery was paused
    pub dispatcher_paused: bool,
}

impl Default for PersistedSlaveState {
    fn default() -> Self {
        Self {
            status: SlaveStatus::Normal,
            max_sequence: 0,
            dispatcher_paused: false,
        }
    }
}

/// Per-master counters that must survive a process restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMasterState {
    /// Sequence assigned to the most recent bootstrap
    pub last_bootstrapped_sequence: i64,
    /// Monotonic transaction sequence counter
    pub transaction_sequence_counter: u64,
}

fn slave_key(slave_id: &str) -> String {
    format!("slave.{slave_id}.state")
}

fn master_key(master_id: &str) -> String {
    format!("master.{master_id}.state")
}

/// Typed helpers over the raw key/value seam.
pub struct StateAccess;

impl StateAccess {
    /// Load the persisted state of one slave.
    pub async fn load_slave(
        store: &dyn StateStore,
        slave_id: &str,
    ) -> Result<Option<PersistedSlaveState>> {
        match store.get(&slave_key(slave_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the state of one slave.
    pub async fn save_slave(
        store: &dyn StateStore,
        slave_id: &str,
        state: &PersistedSlaveState,
    ) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        store.put(&slave_key(slave_id), &raw).await
    }

    /// Load the persisted counters of one master.
    pub async fn load_master(
        store: &dyn StateStore,
        master_id: &str,
    ) -> Result<Option<PersistedMasterState>> {
        match store.get(&master_key(master_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the counters of one master.
    pub async fn save_master(
        store: &dyn StateStore,
        master_id: &str,
        state: &PersistedMasterState,
    ) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        store.put(&master_key(master_id), &raw).await
    }
}

/// In-memory store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON map per store, written atomically via a
/// temp-file rename.
pub struct FileStateStore {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
}

impl FileStateStore {
    /// Open or create the store at the given path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ReplError::Io(e)),
        };
        debug!(path = %path.display(), entries = map.len(), "state store opened");
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    async fn flush(&self, map: &HashMap<String, String>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.write().await;
        map.insert(key.to_string(), value.to_string());
        self.flush(&map).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.map.write().await;
        map.remove(key);
        self.flush(&map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.put("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_slave_state_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(StateAccess::load_slave(&store, "s1").await.unwrap().is_none());

        let state = PersistedSlaveState {
            status: SlaveStatus::Transition,
            max_sequence: 150,
            dispatcher_paused: true,
        };
        StateAccess::save_slave(&store, "s1", &state).await.unwrap();

        let loaded = StateAccess::load_slave(&store, "s1").await.unwrap().unwrap();
        assert_eq!(loaded, state);

        // namespaced per slave
        assert!(StateAccess::load_slave(&store, "s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_master_state_roundtrip() {
        let store = MemoryStateStore::new();
        let state = PersistedMasterState {
            last_bootstrapped_sequence: 12,
            transaction_sequence_counter: 99,
        };
        StateAccess::save_master(&store, "m1", &state).await.unwrap();
        let loaded = StateAccess::load_master(&store, "m1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStateStore::open(&path).await.unwrap();
            store.put("slave.s1.state", "{}").await.unwrap();
            store.put("other", "x").await.unwrap();
            store.delete("other").await.unwrap();
        }

        let store = FileStateStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("slave.s1.state").await.unwrap().as_deref(),
            Some("{}")
        );
        assert_eq!(store.get("other").await.unwrap(), None);
    }
}
