use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use ulid::Ulid;

use decety::config::{Config, DerivedSize, StorageBackend};
use decety::db::{CatalogBackend, LogEntry, ObjectStoreBackend, Tables};
use decety::error::{DecetyError, Result};
use decety::images::ImageDeriver;
use decety::server::routes::build_router;
use decety::server::AppState;
use decety::storage::DecetyStore;
use decety::tokens::TokenRegistry;

/// Deriver that prefixes the source with the requested width, so tests can
/// tell renditions apart without an image toolchain.
pub struct TaggingDeriver;

#[async_trait]
impl ImageDeriver for TaggingDeriver {
    async fn derive(&self, source: Bytes, size: DerivedSize) -> Result<Bytes> {
        let mut out = format!("{}:", size.width).into_bytes();
        out.extend_from_slice(&source);
        Ok(Bytes::from(out))
    }
}

/// Tagging deriver that deletes `token` the first time it runs, so the upload
/// passes its first liveness check and then loses the token before commit.
pub struct RevokingDeriver {
    pub token: String,
    pub registry: OnceLock<Arc<TokenRegistry>>,
    revoked: AtomicBool,
}

impl RevokingDeriver {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            registry: OnceLock::new(),
            revoked: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ImageDeriver for RevokingDeriver {
    async fn derive(&self, source: Bytes, size: DerivedSize) -> Result<Bytes> {
        if !self.revoked.swap(true, Ordering::SeqCst) {
            let registry = self
                .registry
                .get()
                .ok_or_else(|| DecetyError::Internal("registry not wired".into()))?;
            registry.delete(&self.token).await?;
        }
        TaggingDeriver.derive(source, size).await
    }
}

/// Catalog backend over the harness store whose writes can fail or stall on
/// demand.
pub struct ControlledBackend {
    inner: ObjectStoreBackend,
    pub fail_appends: AtomicBool,
    pub fail_counters: AtomicBool,
    /// Delay after an append has been persisted.
    pub append_stall_ms: AtomicU64,
}

impl ControlledBackend {
    pub fn new(store: DecetyStore) -> Self {
        Self {
            inner: ObjectStoreBackend::new(store),
            fail_appends: AtomicBool::new(false),
            fail_counters: AtomicBool::new(false),
            append_stall_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CatalogBackend for ControlledBackend {
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
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(DecetyError::Internal("append rejected".into()));
        }
        self.inner.append(entry).await?;
        let stall = self.append_stall_ms.load(Ordering::SeqCst);
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
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(DecetyError::Internal("counter write rejected".into()));
        }
        self.inner.save_counters(counters).await
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config
}

/// Wired application state over an in-memory object store.
pub struct TestHarness {
    pub store: DecetyStore,
    pub backend: Arc<ControlledBackend>,
    pub state: AppState,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::with_deriver(config, Arc::new(TaggingDeriver)).await
    }

    pub async fn with_deriver(config: Config, deriver: Arc<dyn ImageDeriver>) -> Self {
        let store = DecetyStore::in_memory();
        let backend = Arc::new(ControlledBackend::new(store.clone()));
        let state = AppState::with_backend(config, store.clone(), backend.clone(), deriver)
            .await
            .expect("failed to build app state");
        Self {
            store,
            backend,
            state,
        }
    }

    /// Open the persisted catalog again, as a restarted process would.
    pub async fn reopen(&self) -> AppState {
        AppState::build(test_config(), self.store.clone(), Arc::new(TaggingDeriver))
            .await
            .expect("failed to reopen app state")
    }

    /// Create a token valid for one hour.
    pub async fn live_token(&self, token: &str, shop_id: &str) {
        self.state
            .tokens
            .create(token, shop_id, Utc::now() + Duration::hours(1), "test token")
            .await
            .expect("failed to create token");
    }

    pub async fn upload(&self, token: &str, data: &'static [u8]) -> String {
        self.state
            .images
            .upload(token, Bytes::from_static(data))
            .await
            .expect("failed to upload image")
    }

    /// Serve the router on a random local port and return its base URL.
    pub async fn serve(&self) -> String {
        let app = build_router(self.state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }
}
