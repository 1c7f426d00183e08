//! Durable mirrors for presence records
//!
//! The store writes every record through a [`PresenceBackend`] before
//! committing it in memory. Two backends are provided:
//! - [`MemoryBackend`]: process-local map, used when no data directory is
//!   configured and throughout the tests
//! - [`FileBackend`]: one bincode file per entity id, replaced atomically

use crate::error::BackendError;
use crate::presence::PresenceRecord;
use crate::utils::record_key;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;

const RECORD_EXTENSION: &str = "rec";
const TEMP_EXTENSION: &str = "tmp";

/// Upsert-by-id persistent store for presence records.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Durably writes `record`, replacing any previous record with the same id.
    async fn save(&self, record: &PresenceRecord) -> Result<(), BackendError>;

    /// Loads every stored record.
    async fn load_all(&self) -> Result<Vec<PresenceRecord>, BackendError>;
}

/// In-process backend.
///
/// Writes can be switched to fail with [`MemoryBackend::set_unavailable`],
/// which simulates an outage of the durable store.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, PresenceRecord>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<PresenceRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl PresenceBackend for MemoryBackend {
    async fn save(&self, record: &PresenceRecord) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "memory backend marked unavailable".to_string(),
            ));
        }
        self.records.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PresenceRecord>, BackendError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// Directory of `<sha256(id)>.rec` files, each holding one bincode-encoded
/// record. The id itself lives inside the record, so file names are never
/// decoded.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens the backend, creating `dir` if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, BackendError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("File backend opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", record_key(id), RECORD_EXTENSION))
    }
}

#[async_trait]
impl PresenceBackend for FileBackend {
    async fn save(&self, record: &PresenceRecord) -> Result<(), BackendError> {
        let data = bincode::serialize(record)?;
        let path = self.record_path(&record.id);
        let temp = path.with_extension(TEMP_EXTENSION);

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PresenceRecord>, BackendError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let data = tokio::fs::read(&path).await?;
            match bincode::deserialize::<PresenceRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        Ok(records)
    }
}
