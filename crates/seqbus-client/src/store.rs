//! Checkpoint persistence.
//!
//! The dispatcher hydrates its registration's [`CheckpointMult`] through a
//! store at startup and writes it back on every persisted checkpoint and
//! on graceful shutdown. For a given registration the store is only ever
//! invoked from the dispatcher's task; backends need no cross-registration
//! coordination.

use crate::error::{Error, Result};
use async_trait::async_trait;
use seqbus_core::CheckpointMult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage backend for serialized checkpoints, keyed by registration id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the checkpoint map for a registration.
    async fn save(&self, key: &str, checkpoint: &CheckpointMult) -> Result<()>;

    /// Load the checkpoint map for a registration, if one was persisted.
    async fn load(&self, key: &str) -> Result<Option<CheckpointMult>>;

    /// Drop the persisted checkpoint for a registration.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys with a persisted checkpoint.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared store handle.
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// In-memory store for tests and for registrations that do not need
/// durability.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, CheckpointMult>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, key: &str, checkpoint: &CheckpointMult) -> Result<()> {
        let mut map = self.checkpoints.write().await;
        map.insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<CheckpointMult>> {
        let map = self.checkpoints.read().await;
        Ok(map.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.checkpoints.write().await;
        map.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let map = self.checkpoints.read().await;
        Ok(map.keys().cloned().collect())
    }
}

/// Durable file-backed store: one JSON file per registration, written to a
/// temp file and renamed into place, fsynced by default.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_dir`, creating the directory when
    /// missing.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a store with explicit fsync behavior.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir, fsync })
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(Error::Config(format!("invalid checkpoint key: {key:?}")));
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, key: &str, checkpoint: &CheckpointMult) -> Result<()> {
        Self::validate_key(key)?;
        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(checkpoint.serialize().as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(&temp_path, &file_path).await?;

        debug!(key, "persisted checkpoint");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<CheckpointMult>> {
        Self::validate_key(key)?;
        let file_path = self.file_path(key);
        let contents = match fs::read_to_string(&file_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mult = CheckpointMult::deserialize(&contents)?;
        Ok(Some(mult))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::validate_key(key)?;
        let file_path = self.file_path(key);
        match fs::remove_file(&file_path).await {
            Ok(()) => {
                info!(key, "deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqbus_core::{Checkpoint, PhysicalPartition};
    use tempfile::tempdir;

    fn sample() -> CheckpointMult {
        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(PhysicalPartition::new(0, "orders"), Checkpoint::online(10, 20))
            .unwrap();
        mult
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        store.save("reg-1", &sample()).await.unwrap();
        assert_eq!(store.load("reg-1").await.unwrap(), Some(sample()));
        assert_eq!(store.list().await.unwrap(), vec!["reg-1"]);

        store.delete("reg-1").await.unwrap();
        assert_eq!(store.load("reg-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        store.save("reg-1", &sample()).await.unwrap();

        // New store over the same directory simulates a restart.
        let store2 = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store2.load("reg-1").await.unwrap(), Some(sample()));
        assert_eq!(store2.list().await.unwrap(), vec!["reg-1"]);
    }

    #[tokio::test]
    async fn test_file_store_missing_key() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load("nothing").await.unwrap(), None);
        store.delete("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_bad_keys() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        for key in ["", "a/b", "a\\b", "../escape"] {
            assert!(store.save(key, &sample()).await.is_err(), "key {key:?}");
        }
    }
}
