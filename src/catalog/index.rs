use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::db::{Database, Op, Tables};
use crate::error::{DecetyError, Result};
use crate::types::{FeatureVector, ImageId, ItemGroup, ItemKey, ItemVariant};

use super::counters::RequestCounters;
use super::matcher::Matcher;

/// A variant registration before it is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDraft {
    pub key: ItemKey,
    pub variant_type: String,
    pub features: FeatureVector,
    pub image_ids: Vec<ImageId>,
}

/// Outcome of a successful public match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    #[serde(rename = "type")]
    pub variant_type: String,
    pub image_ids: Vec<ImageId>,
    pub request_count: u64,
}

/// Owns the item key -> variant list relation and the request counters.
pub struct CatalogIndex {
    db: Arc<Database>,
    counters: RequestCounters,
    matcher: Matcher,
    max_images_per_variant: usize,
}

impl CatalogIndex {
    pub fn new(
        db: Arc<Database>,
        counters: RequestCounters,
        matcher: Matcher,
        max_images_per_variant: usize,
    ) -> Self {
        Self {
            db,
            counters,
            matcher,
            max_images_per_variant,
        }
    }

    /// Validate a registration against the current state without writing.
    /// [`register_variant`](Self::register_variant) repeats the same checks
    /// inside its transaction.
    pub fn check_registration(&self, token: &str, draft: &VariantDraft) -> Result<()> {
        self.check_shape(draft)?;
        self.db.read(|t| self.check_against(t, token, draft))
    }

    #[instrument(skip(self, draft), fields(token = token, key = %draft.key, variant_type = %draft.variant_type))]
    pub async fn register_variant(&self, token: &str, draft: VariantDraft) -> Result<ItemVariant> {
        self.check_shape(&draft)?;

        let variant = self
            .db
            .transaction(|t| {
                self.check_against(t, token, &draft)?;
                let variant = ItemVariant {
                    id: Ulid::new(),
                    key: draft.key,
                    variant_type: draft.variant_type,
                    features: draft.features,
                    image_ids: draft.image_ids,
                    owner: token.to_string(),
                    request_count: 0,
                    created_at: Utc::now(),
                };
                t.push(Op::PushVariant(variant.clone()));
                Ok(variant)
            })
            .await?;

        crate::metrics::VARIANTS_REGISTERED_TOTAL.inc();
        info!(images = variant.image_ids.len(), "variant registered");
        Ok(variant)
    }

    /// Every variant of `key` in registration order, regardless of owner.
    pub fn lookup(&self, key: &ItemKey) -> Vec<ItemVariant> {
        let mut variants = self
            .db
            .read(|t| t.items.get(key).cloned())
            .unwrap_or_default();
        for v in &mut variants {
            v.request_count = self.counters.get(&v.id);
        }
        variants
    }

    /// Bump the request counter of one variant, returning the new value.
    #[instrument(skip(self), fields(key = %key))]
    pub fn increment_request_count(&self, key: &ItemKey, variant_type: &str) -> Result<u64> {
        let id = self
            .db
            .read(|t| {
                t.items
                    .get(key)
                    .and_then(|vs| vs.iter().find(|v| v.variant_type == variant_type))
                    .map(|v| v.id)
            })
            .ok_or(DecetyError::UnknownItem)?;
        Ok(self.counters.increment(id))
    }

    /// Nearest live variant of `key` for `query`. The request counter of the
    /// winner is bumped best-effort: a failed bump is logged and the match
    /// is returned with the previous count.
    #[instrument(skip(self, query), fields(key = %key))]
    pub fn match_item(&self, key: &ItemKey, query: &FeatureVector) -> Result<MatchResult> {
        check_features(query)?;

        let start = std::time::Instant::now();
        let now = Utc::now();
        let best = self.db.read(|t| {
            let variants = t.items.get(key).ok_or(DecetyError::UnknownItem)?;
            self.matcher
                .best_match(variants, query, |owner| t.token_is_live(owner, now))
                .cloned()
                .ok_or(DecetyError::NoMatch)
        });
        crate::metrics::MATCH_DURATION.observe(start.elapsed().as_secs_f64());

        let best = match best {
            Ok(v) => v,
            Err(e) => {
                let outcome = match e {
                    DecetyError::UnknownItem => "unknown_item",
                    _ => "no_match",
                };
                crate::metrics::MATCHES_TOTAL.with_label_values(&[outcome]).inc();
                return Err(e);
            }
        };
        crate::metrics::MATCHES_TOTAL.with_label_values(&["matched"]).inc();

        let request_count = self.bump(&best);
        debug!(variant_type = %best.variant_type, request_count, "matched");
        Ok(MatchResult {
            variant_type: best.variant_type,
            image_ids: best.image_ids,
            request_count,
        })
    }

    fn bump(&self, variant: &ItemVariant) -> u64 {
        match self.increment_request_count(&variant.key, &variant.variant_type) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, variant_type = %variant.variant_type, "request counter not updated");
                self.counters.get(&variant.id)
            }
        }
    }

    /// Write the request counters to storage.
    pub async fn flush_counters(&self) -> Result<usize> {
        self.counters.flush(&self.db).await
    }

    /// Variants owned by `token`, grouped by item key with summed counters.
    pub fn list_by_token(&self, token: &str) -> Vec<ItemGroup> {
        let tables = self.db.snapshot();
        let mut groups: Vec<ItemGroup> = tables
            .items
            .iter()
            .filter_map(|(key, variants)| {
                let owned: Vec<ItemVariant> = variants
                    .iter()
                    .filter(|v| v.owner == token)
                    .map(|v| ItemVariant {
                        request_count: self.counters.get(&v.id),
                        ..v.clone()
                    })
                    .collect();
                if owned.is_empty() {
                    return None;
                }
                Some(ItemGroup {
                    key: key.clone(),
                    request_count: owned.iter().map(|v| v.request_count).sum(),
                    variants: owned,
                })
            })
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }

    fn check_shape(&self, draft: &VariantDraft) -> Result<()> {
        if draft.variant_type.is_empty() {
            return Err(DecetyError::InvalidInput("type must not be empty".into()));
        }
        if draft.key.item_id.is_empty() || draft.key.color.is_empty() || draft.key.size.is_empty() {
            return Err(DecetyError::InvalidInput(
                "id, color and size must not be empty".into(),
            ));
        }
        check_features(&draft.features)?;
        if draft.image_ids.is_empty() || draft.image_ids.len() > self.max_images_per_variant {
            return Err(DecetyError::InvalidInput(format!(
                "between 1 and {} image ids required, got {}",
                self.max_images_per_variant,
                draft.image_ids.len()
            )));
        }
        Ok(())
    }

    fn check_against(&self, t: &Tables, token: &str, draft: &VariantDraft) -> Result<()> {
        let owner = t
            .tokens
            .get(token)
            .filter(|tok| tok.is_live_at(Utc::now()))
            .ok_or(DecetyError::Unauthorized)?;
        if owner.shop_id != draft.key.shop_id {
            return Err(DecetyError::Unauthorized);
        }
        for id in &draft.image_ids {
            if !t.images.get(id).is_some_and(|img| img.owner == token) {
                return Err(DecetyError::UnknownImage { id: id.clone() });
            }
        }
        let taken = t
            .items
            .get(&draft.key)
            .is_some_and(|vs| vs.iter().any(|v| v.variant_type == draft.variant_type));
        if taken {
            return Err(DecetyError::Conflict(format!(
                "type {} already registered for {}",
                draft.variant_type, draft.key
            )));
        }
        Ok(())
    }
}

fn check_features(features: &FeatureVector) -> Result<()> {
    if features.iter().any(|f| !f.is_finite()) {
        return Err(DecetyError::InvalidInput(
            "feature values must be finite".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Weights;
    use crate::db::{CatalogBackend, ObjectStoreBackend};
    use crate::storage::DecetyStore;
    use crate::types::{ImageRecord, Token};
    use chrono::Duration;

    async fn catalog(store: &DecetyStore) -> (Arc<Database>, CatalogIndex) {
        let backend: Arc<dyn CatalogBackend> = Arc::new(ObjectStoreBackend::new(store.clone()));
        let db = Arc::new(Database::open(backend.clone(), 100).await.unwrap());
        let counters = RequestCounters::load(backend).await.unwrap();
        let index = CatalogIndex::new(db.clone(), counters, Matcher::new(Weights::UNIFORM), 4);
        (db, index)
    }

    async fn seed(db: &Database, token: &str, image: &str) {
        db.transaction(|t| {
            t.push(Op::CreateToken(Token {
                id: token.into(),
                shop_id: "77".into(),
                expiration: Utc::now() + Duration::hours(1),
                description: String::new(),
                created_at: Utc::now(),
            }));
            t.push(Op::PutImage(ImageRecord {
                id: image.into(),
                owner: token.into(),
                size_bytes: 1,
                created_at: Utc::now(),
            }));
            Ok(())
        })
        .await
        .unwrap();
    }

    fn draft(variant_type: &str, features: FeatureVector, image: &str) -> VariantDraft {
        VariantDraft {
            key: ItemKey::new("77", "shirt", "red", "M", None),
            variant_type: variant_type.into(),
            features,
            image_ids: vec![image.into()],
        }
    }

    #[tokio::test]
    async fn test_match_bumps_counter_of_winner() {
        let store = DecetyStore::in_memory();
        let (db, catalog) = catalog(&store).await;
        seed(&db, "tok", "img").await;
        catalog.register_variant("tok", draft("a", [0.0; 5], "img")).await.unwrap();
        catalog.register_variant("tok", draft("b", [9.0; 5], "img")).await.unwrap();

        let key = ItemKey::new("77", "shirt", "red", "M", None);
        for expected in 1..=3 {
            let hit = catalog.match_item(&key, &[8.0; 5]).unwrap();
            assert_eq!(hit.variant_type, "b");
            assert_eq!(hit.request_count, expected);
        }
        let counts: Vec<u64> = catalog.lookup(&key).iter().map(|v| v.request_count).collect();
        assert_eq!(counts, vec![0, 3]);
        assert_eq!(catalog.list_by_token("tok")[0].request_count, 3);
    }

    #[tokio::test]
    async fn test_failed_bump_returns_previous_count() {
        let store = DecetyStore::in_memory();
        let (db, catalog) = catalog(&store).await;
        seed(&db, "tok", "img").await;
        let variant = catalog.register_variant("tok", draft("a", [0.0; 5], "img")).await.unwrap();
        let key = variant.key.clone();
        assert_eq!(catalog.match_item(&key, &[0.0; 5]).unwrap().request_count, 1);

        // the variant disappears between the match and the bump
        db.transaction(|t| {
            t.push(Op::DeleteToken("tok".into()));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(catalog.bump(&variant), 1);
        assert!(matches!(
            catalog.increment_request_count(&key, "a"),
            Err(DecetyError::UnknownItem)
        ));
    }

    #[tokio::test]
    async fn test_counters_survive_reopen_after_flush() {
        let store = DecetyStore::in_memory();
        let key = {
            let (db, catalog) = catalog(&store).await;
            seed(&db, "tok", "img").await;
            let variant = catalog.register_variant("tok", draft("a", [0.0; 5], "img")).await.unwrap();
            catalog.match_item(&variant.key, &[0.0; 5]).unwrap();
            catalog.match_item(&variant.key, &[0.0; 5]).unwrap();
            assert_eq!(catalog.flush_counters().await.unwrap(), 1);
            // nothing changed since the last flush
            assert_eq!(catalog.flush_counters().await.unwrap(), 0);
            variant.key
        };

        let (_db, catalog) = catalog(&store).await;
        assert_eq!(catalog.lookup(&key)[0].request_count, 2);
        assert_eq!(catalog.match_item(&key, &[0.0; 5]).unwrap().request_count, 3);
    }

    #[tokio::test]
    async fn test_flush_drops_counters_of_deleted_variants() {
        let store = DecetyStore::in_memory();
        let (db, catalog) = catalog(&store).await;
        seed(&db, "tok", "img").await;
        let variant = catalog.register_variant("tok", draft("a", [0.0; 5], "img")).await.unwrap();
        catalog.match_item(&variant.key, &[0.0; 5]).unwrap();
        db.transaction(|t| {
            t.push(Op::DeleteToken("tok".into()));
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(catalog.flush_counters().await.unwrap(), 0);
        let backend = ObjectStoreBackend::new(store);
        assert!(backend.load_counters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_rejects_duplicate_type() {
        let store = DecetyStore::in_memory();
        let (db, catalog) = catalog(&store).await;
        seed(&db, "tok", "img").await;
        catalog.register_variant("tok", draft("a", [0.0; 5], "img")).await.unwrap();
        let err = catalog
            .register_variant("tok", draft("a", [1.0; 5], "img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecetyError::Conflict(_)));
        assert_eq!(catalog.lookup(&draft("a", [0.0; 5], "img").key).len(), 1);
    }
}
