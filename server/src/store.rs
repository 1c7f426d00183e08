//! Authoritative in-memory presence map, mirrored to a durable backend
//!
//! Records are spread over a fixed set of shards keyed by a hash of the
//! entity id. Each shard carries two locks:
//! - an async writer lock, held for the whole write including the
//!   durability mirror, so writes to one id are linearizable
//! - a synchronous lock over the committed records, held only while a
//!   record is inserted or cloned out
//!
//! Readers therefore never wait on a slow backend and never observe a record
//! that has not been durably written.

use crate::error::{PresenceError, Result};
use crate::persistence::PresenceBackend;
use crate::presence::PresenceRecord;
use fleetcast_shared::Location;
use log::{error, info};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_SHARD_COUNT: usize = 16;

struct Shard {
    writer: Mutex<()>,
    records: RwLock<HashMap<String, PresenceRecord>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            records: RwLock::new(HashMap::new()),
        }
    }
}

pub struct PresenceStore {
    shards: Vec<Shard>,
    backend: Arc<dyn PresenceBackend>,
}

impl PresenceStore {
    pub fn new(backend: Arc<dyn PresenceBackend>) -> Self {
        Self::with_shards(backend, DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(backend: Arc<dyn PresenceBackend>, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            backend,
        }
    }

    /// Builds a store holding every record the backend already has.
    pub async fn restore(backend: Arc<dyn PresenceBackend>) -> Result<Self> {
        let records = backend.load_all().await?;
        let store = Self::new(backend);

        for record in records {
            store.shard(&record.id).records.write().insert(record.id.clone(), record);
        }

        info!("Restored {} presence records", store.len());
        Ok(store)
    }

    fn shard(&self, id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Creates or overwrites the record for `id`.
    pub async fn upsert(
        &self,
        id: &str,
        location: Location,
        online: bool,
        timestamp: u64,
    ) -> Result<PresenceRecord> {
        self.upsert_and_then(id, location, online, timestamp, |_| ())
            .await
    }

    /// Like [`upsert`](Self::upsert), running `on_commit` with the committed
    /// record before the writer lock for `id` is released.
    ///
    /// Anything done in `on_commit` is ordered per id exactly like the
    /// writes themselves. It must not block.
    pub async fn upsert_and_then<F>(
        &self,
        id: &str,
        location: Location,
        online: bool,
        timestamp: u64,
        on_commit: F,
    ) -> Result<PresenceRecord>
    where
        F: FnOnce(&PresenceRecord),
    {
        if id.is_empty() {
            return Err(PresenceError::Validation("id must not be empty".to_string()));
        }
        if let Some(reason) = location.range_error() {
            return Err(PresenceError::Validation(reason));
        }

        let shard = self.shard(id);
        let _writer = shard.writer.lock().await;

        let previous_seen = shard.records.read().get(id).map(|r| r.last_seen);
        let last_seen = previous_seen.map_or(timestamp, |seen| seen.max(timestamp));
        let record = PresenceRecord::new(id, location, online, last_seen);

        self.commit(shard, record, on_commit).await
    }

    /// Demotes `id` to offline if it is still online and was last seen
    /// before `cutoff`. Returns the demoted record, or None when nothing
    /// changed.
    pub async fn mark_offline_if_stale<F>(
        &self,
        id: &str,
        cutoff: u64,
        on_commit: F,
    ) -> Result<Option<PresenceRecord>>
    where
        F: FnOnce(&PresenceRecord),
    {
        let shard = self.shard(id);
        let _writer = shard.writer.lock().await;

        let current = match shard.records.read().get(id) {
            Some(record) => record.clone(),
            None => return Err(PresenceError::NotFound(id.to_string())),
        };

        if !current.online || current.last_seen >= cutoff {
            return Ok(None);
        }

        let record = PresenceRecord {
            online: false,
            ..current
        };
        self.commit(shard, record, on_commit).await.map(Some)
    }

    async fn commit<F>(&self, shard: &Shard, record: PresenceRecord, on_commit: F) -> Result<PresenceRecord>
    where
        F: FnOnce(&PresenceRecord),
    {
        if let Err(e) = self.backend.save(&record).await {
            error!("Durable write for {} failed: {}", record.id, e);
            return Err(e.into());
        }

        shard
            .records
            .write()
            .insert(record.id.clone(), record.clone());
        on_commit(&record);

        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<PresenceRecord> {
        self.shard(id)
            .records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PresenceError::NotFound(id.to_string()))
    }

    /// Point-in-time copy of every record.
    ///
    /// All shard read guards are held together while copying, so the result
    /// reflects a single instant across the whole store.
    pub fn list(&self) -> Vec<PresenceRecord> {
        let guards: Vec<_> = self.shards.iter().map(|s| s.records.read()).collect();
        guards
            .iter()
            .flat_map(|records| records.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.records.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
