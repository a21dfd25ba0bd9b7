use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashSet;
use tracing::{debug, info, instrument, warn};

use crate::config::ImagesConfig;
use crate::db::{Database, Op};
use crate::error::{DecetyError, Result};
use crate::ids::IdGenerator;
use crate::storage::DecetyStore;
use crate::types::{ImageId, ImageRecord, ImageVariant};

use super::derive::ImageDeriver;

/// Owns image ids, their owning token, and the raw and derived bytes.
pub struct ImageStore {
    db: Arc<Database>,
    store: DecetyStore,
    deriver: Arc<dyn ImageDeriver>,
    config: ImagesConfig,
    ids: IdGenerator,
    /// Ids handed out to uploads that have not committed yet.
    reserved: DashSet<ImageId>,
}

/// Releases a reserved id when the upload finishes, whatever the outcome.
struct Reservation<'a> {
    reserved: &'a DashSet<ImageId>,
    id: ImageId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.id);
    }
}

impl ImageStore {
    pub fn new(
        db: Arc<Database>,
        store: DecetyStore,
        deriver: Arc<dyn ImageDeriver>,
        config: ImagesConfig,
    ) -> Self {
        Self {
            db,
            store,
            deriver,
            config,
            ids: IdGenerator::default(),
            reserved: DashSet::new(),
        }
    }

    /// Object key of one rendition of an image.
    pub fn object_key(id: &str, variant: ImageVariant) -> String {
        format!("images/{id}/{variant}")
    }

    /// Store a new image for `owner`, returning its id.
    ///
    /// Thumbnail and preview are derived before anything is written. The index
    /// entry is committed last, so the image only becomes fetchable once all
    /// three renditions exist; on any failure the written bytes are removed.
    #[instrument(skip(self, data), fields(owner = owner, len = data.len()))]
    pub async fn upload(&self, owner: &str, data: Bytes) -> Result<ImageId> {
        if data.is_empty() {
            return Err(DecetyError::InvalidInput("empty image payload".into()));
        }
        if !self.db.read(|t| t.token_is_live(owner, Utc::now())) {
            return Err(DecetyError::Unauthorized);
        }

        let thumbnail = self
            .deriver
            .derive(data.clone(), self.config.thumbnail)
            .await?;
        let preview = self.deriver.derive(data.clone(), self.config.preview).await?;

        let reservation = self.reserve_id()?;
        let id = reservation.id.clone();
        let size_bytes = data.len() as u64;

        let renditions = [
            (ImageVariant::Raw, data),
            (ImageVariant::Thumbnail, thumbnail),
            (ImageVariant::Preview, preview),
        ];
        for (variant, bytes) in renditions {
            if let Err(e) = self.store.put(&Self::object_key(&id, variant), bytes).await {
                self.discard_assets(&id).await;
                return Err(e);
            }
        }

        let record = ImageRecord {
            id: id.clone(),
            owner: owner.to_string(),
            size_bytes,
            created_at: Utc::now(),
        };
        let committed = self
            .db
            .transaction(|t| {
                if !t.token_is_live(owner, Utc::now()) {
                    return Err(DecetyError::Unauthorized);
                }
                if t.images.contains_key(&record.id) {
                    return Ok(false);
                }
                t.push(Op::PutImage(record));
                Ok(true)
            })
            .await;
        match committed {
            Ok(true) => {}
            // the bytes under this id belong to the committed upload
            Ok(false) => {
                return Err(DecetyError::Internal(format!(
                    "image id {id} committed twice"
                )))
            }
            Err(e) => {
                self.discard_assets(&id).await;
                return Err(e);
            }
        }

        crate::metrics::IMAGES_UPLOADED_TOTAL.inc();
        info!(image_id = %id, "image uploaded");
        Ok(id)
    }

    /// Read one rendition. Unknown ids and ids whose owner is no longer live
    /// are both `NotFound`.
    #[instrument(skip(self), fields(image_id = id, variant = %variant))]
    pub async fn fetch(&self, id: &str, variant: ImageVariant) -> Result<Bytes> {
        let visible = self.db.read(|t| {
            t.images
                .get(id)
                .is_some_and(|img| t.token_is_live(&img.owner, Utc::now()))
        });
        if !visible {
            return Err(DecetyError::NotFound { key: id.to_string() });
        }
        self.store.get(&Self::object_key(id, variant)).await
    }

    pub fn exists(&self, id: &str) -> bool {
        self.db.read(|t| t.images.contains_key(id))
    }

    pub fn owned_by(&self, id: &str, token_id: &str) -> bool {
        self.db
            .read(|t| t.images.get(id).is_some_and(|img| img.owner == token_id))
    }

    /// Remove the bytes of images whose index entries are already gone.
    /// Every id is attempted; the first failure is returned.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn remove_assets(&self, ids: &[ImageId]) -> Result<()> {
        let mut first_err = None;
        for id in ids {
            for variant in ImageVariant::ALL {
                if let Err(e) = self.store.delete(&Self::object_key(id, variant)).await {
                    warn!(image_id = %id, variant = %variant, error = %e, "failed to delete image bytes");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!("removed image assets");
                Ok(())
            }
        }
    }

    fn reserve_id(&self) -> Result<Reservation<'_>> {
        // reserve first, then check the committed state, so an id committed
        // after the reservation was taken cannot be handed out
        let id = self.ids.next(|candidate| {
            if !self.reserved.insert(candidate.to_string()) {
                return true;
            }
            let committed = self.db.read(|t| t.images.contains_key(candidate));
            if committed {
                self.reserved.remove(candidate);
            }
            committed
        })?;
        Ok(Reservation {
            reserved: &self.reserved,
            id,
        })
    }

    async fn discard_assets(&self, id: &str) {
        if let Err(e) = self.remove_assets(&[id.to_string()]).await {
            warn!(image_id = id, error = %e, "failed to discard staged image bytes");
        }
    }
}
