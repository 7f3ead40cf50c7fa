//! Durable transfer checkpoints.
//!
//! One JSON document per transfer id under a state directory, plus an
//! in-memory read cache. Records survive process restarts; `save` is an
//! upsert stamped with the wall clock, and concurrent saves for the same id
//! are serialized by the store (last writer wins).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

/// Checkpoint persistence errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// State-file I/O failure
    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One durable progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Transfer id as its decimal string
    pub file_id: String,
    /// Highest chunk index acknowledged at save time
    pub last_chunk: u32,
    /// Total file size in bytes
    pub file_size: u64,
    /// Unix seconds of the last save
    pub updated_at: u64,
}

/// Durable key/value checkpoint store keyed by transfer id.
pub struct CheckpointStore {
    state_dir: PathBuf,
    cache: RwLock<HashMap<String, CheckpointRecord>>,
}

impl CheckpointStore {
    /// Create a store rooted at `state_dir` (not yet created on disk).
    #[must_use]
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn initialize(&self) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    /// Upsert the record for a transfer, stamping `updated_at` with the
    /// wall clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub async fn save(
        &self,
        file_id: &str,
        last_chunk: u32,
        file_size: u64,
    ) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            file_id: file_id.to_string(),
            last_chunk,
            file_size,
            updated_at: unix_now(),
        };

        // Hold the write lock across the disk write so concurrent saves for
        // the same id serialize, last writer winning on disk and in cache.
        let mut cache = self.cache.write().await;
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(self.record_path(file_id), json).await?;
        cache.insert(file_id.to_string(), record);

        Ok(())
    }

    /// Load the saved `last_chunk` for a transfer, if a record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an on-disk record exists but cannot be read or
    /// parsed.
    pub async fn load(&self, file_id: &str) -> Result<Option<u32>, CheckpointError> {
        {
            let cache = self.cache.read().await;
            if let Some(record) = cache.get(file_id) {
                return Ok(Some(record.last_chunk));
            }
        }

        let path = self.record_path(file_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).await?;
        let record: CheckpointRecord = serde_json::from_str(&json)?;
        let last_chunk = record.last_chunk;

        self.cache
            .write()
            .await
            .insert(file_id.to_string(), record);

        Ok(Some(last_chunk))
    }

    /// Remove the record for a transfer, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record file cannot be removed.
    pub async fn clear(&self, file_id: &str) -> Result<(), CheckpointError> {
        let mut cache = self.cache.write().await;
        cache.remove(file_id);

        let path = self.record_path(file_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }

        Ok(())
    }

    fn record_path(&self, file_id: &str) -> PathBuf {
        self.state_dir.join(format!("{file_id}.json"))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
