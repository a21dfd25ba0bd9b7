//! Shop-scoped bearer tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument};

use crate::db::{Cascade, Database, Op};
use crate::error::{DecetyError, Result};
use crate::ids::IdGenerator;
use crate::images::ImageStore;
use crate::types::{ShopId, Token, TokenId, TokenSummary};

/// Result of a token deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub existed: bool,
    pub images_removed: usize,
    pub variants_removed: usize,
}

/// Owns the token -> (shop, expiration, description) relation and the
/// shop -> token uniqueness constraint.
pub struct TokenRegistry {
    db: Arc<Database>,
    images: Arc<ImageStore>,
    ids: IdGenerator,
    /// Per-token locks serializing create/edit/delete of the same token id.
    /// An entry lives only while some caller holds or waits on it.
    locks: Arc<DashMap<TokenId, Arc<Mutex<()>>>>,
}

/// Held for the duration of one token mutation; the lock entry is pruned on
/// drop once nobody else references it.
struct TokenGuard {
    id: TokenId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<TokenId, Arc<Mutex<()>>>>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl TokenRegistry {
    pub fn new(db: Arc<Database>, images: Arc<ImageStore>) -> Self {
        Self {
            db,
            images,
            ids: IdGenerator::default(),
            locks: Arc::new(DashMap::new()),
        }
    }

    async fn lock_token(&self, token_id: &str) -> TokenGuard {
        let lock = self
            .locks
            .entry(token_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        TokenGuard {
            id: token_id.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    #[instrument(skip(self, description), fields(token = token_id, shop_id = shop_id))]
    pub async fn create(
        &self,
        token_id: &str,
        shop_id: &str,
        expiration: DateTime<Utc>,
        description: &str,
    ) -> Result<Token> {
        if token_id.is_empty() || shop_id.is_empty() {
            return Err(DecetyError::InvalidInput(
                "token and shop_id must not be empty".into(),
            ));
        }

        let _guard = self.lock_token(token_id).await;

        let token = Token {
            id: token_id.to_string(),
            shop_id: shop_id.to_string(),
            expiration,
            description: description.to_string(),
            created_at: Utc::now(),
        };

        let created = self
            .db
            .transaction(|t| {
                if t.tokens.contains_key(token_id) {
                    return Err(DecetyError::Conflict(format!(
                        "token {token_id} already exists"
                    )));
                }
                if t.shops.contains_key(shop_id) {
                    return Err(DecetyError::Conflict(format!(
                        "shop {shop_id} already bound to a token"
                    )));
                }
                t.push(Op::CreateToken(token.clone()));
                Ok(token)
            })
            .await?;

        info!(expiration = %created.expiration, "token created");
        Ok(created)
    }

    #[instrument(skip(self, new_description), fields(token = token_id, shop_id = new_shop_id))]
    pub async fn edit(
        &self,
        token_id: &str,
        new_shop_id: &str,
        new_description: &str,
        new_expiration: DateTime<Utc>,
    ) -> Result<Token> {
        if new_shop_id.is_empty() {
            return Err(DecetyError::InvalidInput("shop_id must not be empty".into()));
        }

        let _guard = self.lock_token(token_id).await;

        let updated = self
            .db
            .transaction(|t| {
                let current = t.tokens.get(token_id).cloned().ok_or_else(|| DecetyError::NotFound {
                    key: token_id.to_string(),
                })?;
                if let Some(owner) = t.shops.get(new_shop_id) {
                    if owner != token_id {
                        return Err(DecetyError::Conflict(format!(
                            "shop {new_shop_id} already bound to another token"
                        )));
                    }
                }

                let previous_shop = current.shop_id.clone();
                let token = Token {
                    shop_id: new_shop_id.to_string(),
                    description: new_description.to_string(),
                    expiration: new_expiration,
                    ..current
                };
                t.push(Op::UpdateToken {
                    previous_shop,
                    token: token.clone(),
                });
                Ok(token)
            })
            .await?;

        info!(expiration = %updated.expiration, "token edited");
        Ok(updated)
    }

    /// Delete a token and everything it owns. Deleting an absent token succeeds
    /// and changes nothing.
    #[instrument(skip(self), fields(token = token_id))]
    pub async fn delete(&self, token_id: &str) -> Result<DeleteOutcome> {
        let guard = self.lock_token(token_id).await;
        let db = self.db.clone();
        let images = self.images.clone();
        let token_id = token_id.to_string();

        // Commit and byte removal run detached, so a dropped caller cannot
        // leave the rows deleted and the bytes behind.
        let cascade = tokio::spawn(async move {
            let _guard = guard;
            if !db.read(|t| t.tokens.contains_key(&token_id)) {
                return Ok(Cascade::default());
            }

            let cascade = db
                .transaction(|t| {
                    let cascade = Cascade {
                        token: t.tokens.get(&token_id).cloned(),
                        image_ids: t.images_owned_by(&token_id).map(|img| img.id.clone()).collect(),
                        variants_removed: t.variants_owned_by(&token_id).count(),
                    };
                    t.push(Op::DeleteToken(token_id.clone()));
                    Ok(cascade)
                })
                .await?;

            // The index entries are gone, so the bytes are unreachable even if
            // removal fails here.
            if let Err(e) = images.remove_assets(&cascade.image_ids).await {
                error!(
                    error = %e,
                    orphaned = cascade.image_ids.len(),
                    "token deleted but some image bytes could not be removed"
                );
            }
            Ok::<_, DecetyError>(cascade)
        })
        .await
        .map_err(|e| DecetyError::Internal(format!("token delete task failed: {e}")))??;

        if cascade.token.is_none() {
            return Ok(DeleteOutcome::default());
        }
        let outcome = DeleteOutcome {
            existed: true,
            images_removed: cascade.image_ids.len(),
            variants_removed: cascade.variants_removed,
        };
        info!(
            images = outcome.images_removed,
            variants = outcome.variants_removed,
            "token deleted"
        );
        Ok(outcome)
    }

    pub fn is_live(&self, token_id: &str) -> bool {
        self.db.read(|t| t.token_is_live(token_id, Utc::now()))
    }

    pub fn shop_of(&self, token_id: &str) -> Result<ShopId> {
        self.get(token_id).map(|t| t.shop_id)
    }

    pub fn get(&self, token_id: &str) -> Result<Token> {
        self.db
            .read(|t| t.tokens.get(token_id).cloned())
            .ok_or_else(|| DecetyError::NotFound {
                key: token_id.to_string(),
            })
    }

    /// All tokens ordered by id, with ownership counts for the admin list.
    pub fn list(&self) -> Vec<TokenSummary> {
        let now = Utc::now();
        let tables = self.db.snapshot();
        let mut summaries: Vec<TokenSummary> = tables
            .tokens
            .values()
            .map(|token| TokenSummary {
                live: token.is_live_at(now),
                images_count: tables.images_owned_by(&token.id).count(),
                variants_count: tables.variants_owned_by(&token.id).count(),
                token: token.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.token.id.cmp(&b.token.id));
        summaries
    }

    /// A random token id not yet in use.
    pub fn suggest_token(&self) -> Result<TokenId> {
        let tables = self.db.snapshot();
        self.ids.next(|c| tables.tokens.contains_key(c))
    }

    /// A random numeric shop id not yet bound.
    pub fn suggest_shop_id(&self) -> Result<ShopId> {
        let tables = self.db.snapshot();
        self.ids.next_shop_id(|c| tables.shops.contains_key(c))
    }
}
