use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use ulid::Ulid;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{DecetyError, Result};
use crate::storage::DecetyStore;

use super::log::{LogEntry, LOG_PREFIX};
use super::tables::Tables;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Object key the compacted snapshot is written to.
pub const SNAPSHOT_KEY: &str = "catalog/snapshot.bin";

/// Object key of the flushed request counters.
pub const COUNTERS_KEY: &str = "catalog/counters.bin";

/// Persistence seam of the [`Database`](super::Database): a base snapshot
/// plus the log of transactions committed after it. The storage engine
/// behind it is chosen by configuration, the catalog logic stays the same.
#[async_trait]
pub trait CatalogBackend: Send + Sync {
    /// Load the last compacted state, `None` for a fresh store.
    async fn load_snapshot(&self) -> Result<Option<Tables>>;

    /// Persist a complete state. Must be atomic: either the previous or the new
    /// snapshot is observable afterwards.
    async fn save_snapshot(&self, tables: &Tables) -> Result<()>;

    /// Log entries with a generation above `after`, in generation order.
    async fn read_log(&self, after: u64) -> Result<Vec<LogEntry>>;

    /// Durably write one entry. Writing the same generation twice replaces it.
    async fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Drop log entries up to and including `through`, returning how many.
    async fn truncate_log(&self, through: u64) -> Result<usize>;

    /// Last flushed request counters, keyed by variant id.
    async fn load_counters(&self) -> Result<HashMap<Ulid, u64>>;

    async fn save_counters(&self, counters: &HashMap<Ulid, u64>) -> Result<()>;
}

/// On-disk envelope: the bincode-encoded tables plus an xxh3 checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub generation: u64,
    pub written_at: DateTime<Utc>,
    pub checksum: u64,
    pub payload: Vec<u8>,
}

impl Snapshot {
    pub fn encode(tables: &Tables) -> Result<Self> {
        let payload = bincode::serialize(tables)?;
        Ok(Self {
            version: SNAPSHOT_FORMAT_VERSION,
            generation: tables.generation,
            written_at: Utc::now(),
            checksum: xxh3_64(&payload),
            payload,
        })
    }

    pub fn validate_checksum(&self) -> Result<()> {
        let expected = xxh3_64(&self.payload);
        if self.checksum != expected {
            return Err(DecetyError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }

    pub fn decode(&self) -> Result<Tables> {
        if self.version != SNAPSHOT_FORMAT_VERSION {
            return Err(DecetyError::Internal(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        self.validate_checksum()?;
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Keeps the snapshot, the log entries and the counters as separate objects.
/// A single object put is atomic on every `object_store` engine.
pub struct ObjectStoreBackend {
    store: DecetyStore,
}

impl ObjectStoreBackend {
    pub fn new(store: DecetyStore) -> Self {
        Self { store }
    }

    async fn log_generations(&self) -> Result<Vec<u64>> {
        let mut generations: Vec<u64> = self
            .store
            .list_prefix(LOG_PREFIX)
            .await?
            .iter()
            .filter_map(|key| LogEntry::generation_of(key))
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }
}

#[async_trait]
impl CatalogBackend for ObjectStoreBackend {
    #[instrument(skip(self))]
    async fn load_snapshot(&self) -> Result<Option<Tables>> {
        let data = match self.store.get(SNAPSHOT_KEY).await {
            Ok(data) => data,
            Err(DecetyError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let snapshot = Snapshot::from_bytes(&data)?;
        let tables = snapshot.decode()?;
        debug!(generation = tables.generation, "loaded catalog snapshot");
        Ok(Some(tables))
    }

    #[instrument(skip(self, tables), fields(generation = tables.generation))]
    async fn save_snapshot(&self, tables: &Tables) -> Result<()> {
        let data = Snapshot::encode(tables)?.to_bytes()?;
        self.store.put(SNAPSHOT_KEY, data).await
    }

    #[instrument(skip(self))]
    async fn read_log(&self, after: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for generation in self.log_generations().await? {
            if generation <= after {
                continue;
            }
            let data = self.store.get(&LogEntry::object_key(generation)).await?;
            let entry = LogEntry::from_bytes(&data)?;
            if entry.generation != generation {
                return Err(DecetyError::Internal(format!(
                    "log entry {generation} claims generation {}",
                    entry.generation
                )));
            }
            entries.push(entry);
        }
        debug!(entries = entries.len(), "read commit log");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(generation = entry.generation, ops = entry.ops.len()))]
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        self.store
            .put(&LogEntry::object_key(entry.generation), entry.to_bytes()?)
            .await
    }

    #[instrument(skip(self))]
    async fn truncate_log(&self, through: u64) -> Result<usize> {
        let mut removed = 0;
        for generation in self.log_generations().await? {
            if generation > through {
                break;
            }
            self.store.delete(&LogEntry::object_key(generation)).await?;
            removed += 1;
        }
        debug!(removed, "truncated commit log");
        Ok(removed)
    }

    async fn load_counters(&self) -> Result<HashMap<Ulid, u64>> {
        match self.store.get(COUNTERS_KEY).await {
            Ok(data) => Ok(bincode::deserialize(&data)?),
            Err(DecetyError::NotFound { .. }) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, counters), fields(len = counters.len()))]
    async fn save_counters(&self, counters: &HashMap<Ulid, u64>) -> Result<()> {
        let data = Bytes::from(bincode::serialize(counters)?);
        self.store.put(COUNTERS_KEY, data).await
    }
}
