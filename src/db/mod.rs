//! Embedded catalog database.
//!
//! Readers get a consistent [`Tables`] snapshot without blocking writers.
//! Writers are serialized by the commit lock. A transaction validates against
//! the committed state and records row operations; committing appends them to
//! the log as one entry and only then applies them to the published state.
//! The log is folded into a fresh snapshot every `compact_after` entries.

pub mod log;
pub mod snapshot;
pub mod tables;

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{DecetyError, Result};

pub use log::{LogEntry, Op};
pub use snapshot::{CatalogBackend, ObjectStoreBackend, Snapshot};
pub use tables::{Cascade, Tables};

/// An open transaction. Reads see the state committed before it started;
/// writes are recorded with [`push`](Self::push) and are not visible to
/// reads of the same transaction.
pub struct Txn<'a> {
    tables: &'a Tables,
    ops: Vec<Op>,
}

impl Txn<'_> {
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
}

impl Deref for Txn<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        self.tables
    }
}

pub struct Database {
    shared: Arc<Shared>,
    commit_lock: Arc<Mutex<()>>,
}

/// State the commit task needs after the caller may be gone.
struct Shared {
    backend: Arc<dyn CatalogBackend>,
    current: RwLock<Arc<Tables>>,
    /// Log entries written since the last snapshot.
    log_len: AtomicUsize,
    compact_after: usize,
}

impl Database {
    /// Open the database: load the last snapshot and replay the log after it.
    pub async fn open(backend: Arc<dyn CatalogBackend>, compact_after: usize) -> Result<Self> {
        let mut tables = backend.load_snapshot().await?.unwrap_or_default();
        let entries = backend.read_log(tables.generation).await?;
        for entry in &entries {
            if entry.generation != tables.generation + 1 {
                return Err(DecetyError::Internal(format!(
                    "commit log gap: expected generation {}, found {}",
                    tables.generation + 1,
                    entry.generation
                )));
            }
            for op in &entry.ops {
                tables.apply(op);
            }
            tables.generation = entry.generation;
        }

        info!(
            generation = tables.generation,
            replayed = entries.len(),
            tokens = tables.tokens.len(),
            images = tables.images.len(),
            item_keys = tables.items.len(),
            "opened catalog database"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                current: RwLock::new(Arc::new(tables)),
                log_len: AtomicUsize::new(entries.len()),
                compact_after: compact_after.max(1),
            }),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The latest committed state.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.shared.current.read().clone()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.snapshot();
        f(&tables)
    }

    /// Run `f` against the committed state and commit the operations it
    /// records. A transaction recording nothing commits nothing.
    ///
    /// Once the log write has started, the commit runs to completion on its
    /// own task even if the returned future is dropped.
    #[instrument(skip_all)]
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T>,
    {
        let guard = self.commit_lock.clone().lock_owned().await;

        let (out, ops, generation) = {
            let base = self.snapshot();
            let mut txn = Txn {
                tables: base.as_ref(),
                ops: Vec::new(),
            };
            let out = f(&mut txn)?;
            (out, txn.ops, base.generation + 1)
        };
        if ops.is_empty() {
            return Ok(out);
        }

        let entry = LogEntry::new(generation, ops)?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _guard = guard;
            shared.commit(entry).await
        })
        .await
        .map_err(|e| DecetyError::Internal(format!("commit task failed: {e}")))??;

        debug!(generation, "committed transaction");
        Ok(out)
    }
}

impl Shared {
    async fn commit(&self, entry: LogEntry) -> Result<()> {
        self.backend.append(&entry).await?;

        {
            let mut current = self.current.write();
            let tables = Arc::make_mut(&mut *current);
            for op in &entry.ops {
                tables.apply(op);
            }
            tables.generation = entry.generation;
        }

        if self.log_len.fetch_add(1, Ordering::SeqCst) + 1 >= self.compact_after {
            if let Err(e) = self.compact().await {
                warn!(error = %e, "log compaction failed, will retry on a later commit");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn compact(&self) -> Result<()> {
        let tables = self.current.read().clone();
        self.backend.save_snapshot(&tables).await?;
        self.log_len.store(0, Ordering::SeqCst);

        // entries at or below the snapshot generation are skipped on replay
        let removed = self.backend.truncate_log(tables.generation).await?;
        info!(generation = tables.generation, removed, "compacted commit log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DecetyStore;
    use crate::types::Token;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use ulid::Ulid;

    /// Delegates to an in-memory backend; appends can fail or stall on demand.
    struct FlakyBackend {
        inner: ObjectStoreBackend,
        fail: AtomicBool,
        stall_ms: AtomicU64,
    }

    impl FlakyBackend {
        fn new(store: DecetyStore) -> Self {
            Self {
                inner: ObjectStoreBackend::new(store),
                fail: AtomicBool::new(false),
                stall_ms: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl CatalogBackend for FlakyBackend {
        async fn load_snapshot(&self) -> Result<Option<Tables>> {
            self.inner.load_snapshot().await
        }

        async fn save_snapshot(&self, tables: &Tables) -> Result<()> {
            self.inner.save_snapshot(tables).await
        }

        async fn read_log(&self, after: u64) -> Result<Vec<LogEntry>> {
            self.inner.read_log(after).await
        }

        async fn append(&self, entry: &LogEntry) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DecetyError::Internal("disk full".into()));
            }
            self.inner.append(entry).await?;
            let stall = self.stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(stall)).await;
            }
            Ok(())
        }

        async fn truncate_log(&self, through: u64) -> Result<usize> {
            self.inner.truncate_log(through).await
        }

        async fn load_counters(&self) -> Result<HashMap<Ulid, u64>> {
            self.inner.load_counters().await
        }

        async fn save_counters(&self, counters: &HashMap<Ulid, u64>) -> Result<()> {
            self.inner.save_counters(counters).await
        }
    }

    fn token(id: &str, shop: &str) -> Token {
        Token {
            id: id.into(),
            shop_id: shop.into(),
            expiration: Utc::now() + Duration::hours(1),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    async fn open(store: &DecetyStore, compact_after: usize) -> Database {
        Database::open(Arc::new(ObjectStoreBackend::new(store.clone())), compact_after)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let store = DecetyStore::in_memory();
        let db = open(&store, 100).await;
        db.transaction(|t| {
            t.push(Op::CreateToken(token("t1", "1")));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(db.snapshot().generation, 1);

        // a reopened database replays the log
        let reopened = open(&store, 100).await;
        assert_eq!(reopened.read(|t| t.shops.get("1").cloned()), Some("t1".into()));
        assert_eq!(reopened.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn test_reads_see_committed_state_only() {
        let db = open(&DecetyStore::in_memory(), 100).await;
        db.transaction(|t| {
            t.push(Op::CreateToken(token("t1", "1")));
            assert!(t.tokens.is_empty());
            Ok(())
        })
        .await
        .unwrap();
        assert!(db.read(|t| t.tokens.contains_key("t1")));
    }

    #[tokio::test]
    async fn test_closure_error_discards_changes() {
        let db = open(&DecetyStore::in_memory(), 100).await;
        let res: Result<()> = db
            .transaction(|t| {
                t.push(Op::CreateToken(token("t1", "1")));
                Err(DecetyError::Conflict("nope".into()))
            })
            .await;
        assert!(res.is_err());
        assert!(db.snapshot().shops.is_empty());
        assert_eq!(db.snapshot().generation, 0);
    }

    #[tokio::test]
    async fn test_empty_transaction_writes_nothing() {
        let store = DecetyStore::in_memory();
        let db = open(&store, 100).await;
        db.transaction(|_| Ok(())).await.unwrap();
        assert_eq!(db.snapshot().generation, 0);
        assert!(store.list_prefix(log::LOG_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_discards_changes() {
        let backend = Arc::new(FlakyBackend::new(DecetyStore::in_memory()));
        backend.fail.store(true, Ordering::SeqCst);
        let db = Database::open(backend.clone(), 100).await.unwrap();
        let res = db
            .transaction(|t| {
                t.push(Op::CreateToken(token("t1", "1")));
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(DecetyError::Internal(_))));
        assert!(db.snapshot().shops.is_empty());

        backend.fail.store(false, Ordering::SeqCst);
        db.transaction(|t| {
            t.push(Op::CreateToken(token("t1", "1")));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(db.snapshot().shops.len(), 1);
        assert_eq!(db.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn test_cancelled_transaction_still_publishes() {
        let store = DecetyStore::in_memory();
        let backend = Arc::new(FlakyBackend::new(store.clone()));
        backend.stall_ms.store(200, Ordering::SeqCst);
        let db = Database::open(backend.clone(), 100).await.unwrap();

        let res = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            db.transaction(|t| {
                t.push(Op::CreateToken(token("t1", "1234")));
                Ok(())
            }),
        )
        .await;
        assert!(res.is_err(), "transaction should have timed out");

        // the next writer waits for the orphaned commit to finish
        backend.stall_ms.store(0, Ordering::SeqCst);
        db.transaction(|t| {
            assert!(t.shops.contains_key("1234"));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(db.read(|t| t.shops.get("1234").cloned()), Some("t1".into()));

        let reopened = open(&store, 100).await;
        assert_eq!(reopened.snapshot().shops, db.snapshot().shops);
    }

    #[tokio::test]
    async fn test_compaction_folds_log_into_snapshot() {
        let store = DecetyStore::in_memory();
        let db = open(&store, 3).await;
        for i in 0..7 {
            db.transaction(|t| {
                t.push(Op::CreateToken(token(&format!("t{i}"), &i.to_string())));
                Ok(())
            })
            .await
            .unwrap();
        }

        // compacted at generations 3 and 6, one entry left
        assert_eq!(store.list_prefix(log::LOG_PREFIX).await.unwrap().len(), 1);
        assert!(store.exists(snapshot::SNAPSHOT_KEY).await.unwrap());

        let reopened = open(&store, 3).await;
        assert_eq!(reopened.snapshot().generation, 7);
        assert_eq!(reopened.snapshot().tokens.len(), 7);
    }

    #[tokio::test]
    async fn test_log_gap_refuses_to_open() {
        let store = DecetyStore::in_memory();
        let backend = ObjectStoreBackend::new(store.clone());
        backend
            .append(&LogEntry::new(2, vec![Op::CloseSession("s".into())]).unwrap())
            .await
            .unwrap();
        let res = Database::open(Arc::new(backend), 100).await;
        assert!(matches!(res, Err(DecetyError::Internal(_))));
    }
}
