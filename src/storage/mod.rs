//! Object-store wrapper used for raw image bytes and the catalog snapshot.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use tracing::{debug, instrument};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{DecetyError, Result};

/// Cheaply cloneable handle to the configured object store.
#[derive(Clone)]
pub struct DecetyStore {
    inner: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for DecetyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecetyStore")
            .field("inner", &self.inner.to_string())
            .finish()
    }
}

impl DecetyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// An empty in-memory store, used by tests and the `memory` backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::Memory => Arc::new(InMemory::new()),
            StorageBackend::Local => {
                std::fs::create_dir_all(&config.local_path)?;
                Arc::new(LocalFileSystem::new_with_prefix(&config.local_path)?)
            }
            StorageBackend::S3 => {
                let bucket = config.bucket.as_deref().ok_or_else(|| {
                    DecetyError::Config("storage.bucket is required for s3".into())
                })?;
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(ref region) = config.region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
        };
        debug!(backend = ?config.backend, "initialized object store");
        Ok(Self::new(inner))
    }

    #[instrument(skip(self, data), fields(key = key, len = data.len()))]
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = Path::parse(key)?;
        self.inner.put(&path, PutPayload::from(data)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = key))]
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let path = Path::parse(key)?;
        match self.inner.get(&path).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => Err(DecetyError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let path = Path::parse(key)?;
        match self.inner.head(&path).await {
            Ok(meta) => Ok(meta),
            Err(object_store::Error::NotFound { .. }) => Err(DecetyError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(DecetyError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a single object. Deleting a missing object is not an error.
    #[instrument(skip(self), fields(key = key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::parse(key)?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::parse(prefix)?;
        let metas: Vec<ObjectMeta> = self.inner.list(Some(&path)).try_collect().await?;
        Ok(metas.into_iter().map(|m| m.location.to_string()).collect())
    }
}
