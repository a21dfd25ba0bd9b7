pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::access::AccessGate;
use crate::catalog::{CatalogIndex, Matcher, RequestCounters, Weights};
use crate::config::Config;
use crate::db::{CatalogBackend, Database, ObjectStoreBackend};
use crate::error::Result;
use crate::images::{ImageDeriver, ImageStore};
use crate::rate_limit::FloodLimiter;
use crate::storage::DecetyStore;
use crate::tokens::TokenRegistry;

/// Shared application state injected into all handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: DecetyStore,
    pub db: Arc<Database>,
    pub tokens: Arc<TokenRegistry>,
    pub images: Arc<ImageStore>,
    pub catalog: Arc<CatalogIndex>,
    pub gate: Arc<AccessGate>,
    pub limiter: Arc<FloodLimiter>,
}

impl AppState {
    /// Open the catalog on `store` and wire every component together.
    pub async fn build(
        config: Config,
        store: DecetyStore,
        deriver: Arc<dyn ImageDeriver>,
    ) -> Result<Self> {
        let backend = Arc::new(ObjectStoreBackend::new(store.clone()));
        Self::with_backend(config, store, backend, deriver).await
    }

    /// Like [`build`](Self::build) with the catalog persisted through `backend`.
    pub async fn with_backend(
        config: Config,
        store: DecetyStore,
        backend: Arc<dyn CatalogBackend>,
        deriver: Arc<dyn ImageDeriver>,
    ) -> Result<Self> {
        let db = Arc::new(Database::open(backend.clone(), config.catalog.compact_after_entries).await?);
        let counters = RequestCounters::load(backend).await?;

        let images = Arc::new(ImageStore::new(
            db.clone(),
            store.clone(),
            deriver,
            config.images.clone(),
        ));
        let tokens = Arc::new(TokenRegistry::new(db.clone(), images.clone()));
        let catalog = Arc::new(CatalogIndex::new(
            db.clone(),
            counters,
            Matcher::new(Weights(config.catalog.weight_vector())),
            config.catalog.max_images_per_variant,
        ));
        let gate = Arc::new(AccessGate::new(db.clone(), config.admin.clone()));
        let limiter = Arc::new(FloodLimiter::from_config(&config.rate_limit));

        Ok(Self {
            config: Arc::new(config),
            store,
            db,
            tokens,
            images,
            catalog,
            gate,
            limiter,
        })
    }
}
