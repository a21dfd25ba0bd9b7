use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ImageId, ImageRecord, ItemKey, ItemVariant, ShopId, Token, TokenId};

use super::log::Op;

/// Every relation the service persists. One value of this type is one
/// consistent database state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    /// Incremented on every committed transaction.
    pub generation: u64,
    pub tokens: HashMap<TokenId, Token>,
    /// Inverse of `Token::shop_id`.
    pub shops: HashMap<ShopId, TokenId>,
    pub images: HashMap<ImageId, ImageRecord>,
    /// Variants per key, in registration order.
    pub items: HashMap<ItemKey, Vec<ItemVariant>>,
    /// Admin session id -> expiry.
    pub sessions: HashMap<String, DateTime<Utc>>,
}

/// Rows removed by a token cascade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cascade {
    pub token: Option<Token>,
    pub image_ids: Vec<ImageId>,
    pub variants_removed: usize,
}

impl Tables {
    pub fn token_is_live(&self, token_id: &str, now: DateTime<Utc>) -> bool {
        self.tokens
            .get(token_id)
            .is_some_and(|t| t.is_live_at(now))
    }

    pub fn images_owned_by<'a>(&'a self, token_id: &'a str) -> impl Iterator<Item = &'a ImageRecord> {
        self.images.values().filter(move |img| img.owner == token_id)
    }

    pub fn variants_owned_by<'a>(
        &'a self,
        token_id: &'a str,
    ) -> impl Iterator<Item = &'a ItemVariant> {
        self.items
            .values()
            .flat_map(|vs| vs.iter())
            .filter(move |v| v.owner == token_id)
    }

    /// Remove a token, its shop binding, its images and its variants.
    /// Keys left without variants are dropped.
    pub fn cascade_delete_token(&mut self, token_id: &str) -> Cascade {
        let Some(token) = self.tokens.remove(token_id) else {
            return Cascade::default();
        };

        if self.shops.get(&token.shop_id).map(String::as_str) == Some(token_id) {
            self.shops.remove(&token.shop_id);
        }

        let image_ids: Vec<ImageId> = self
            .images
            .iter()
            .filter(|(_, img)| img.owner == token_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &image_ids {
            self.images.remove(id);
        }

        let mut variants_removed = 0;
        self.items.retain(|_, variants| {
            let before = variants.len();
            variants.retain(|v| v.owner != token_id);
            variants_removed += before - variants.len();
            !variants.is_empty()
        });

        Cascade {
            token: Some(token),
            image_ids,
            variants_removed,
        }
    }

    /// Apply one committed operation. Operations are validated before they
    /// are logged, so applying never fails.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::CreateToken(token) => {
                self.shops.insert(token.shop_id.clone(), token.id.clone());
                self.tokens.insert(token.id.clone(), token.clone());
            }
            Op::UpdateToken {
                previous_shop,
                token,
            } => {
                if self.shops.get(previous_shop) == Some(&token.id) {
                    self.shops.remove(previous_shop);
                }
                self.shops.insert(token.shop_id.clone(), token.id.clone());
                self.tokens.insert(token.id.clone(), token.clone());
            }
            Op::DeleteToken(token_id) => {
                self.cascade_delete_token(token_id);
            }
            Op::PutImage(record) => {
                self.images.insert(record.id.clone(), record.clone());
            }
            Op::PushVariant(variant) => {
                self.items
                    .entry(variant.key.clone())
                    .or_default()
                    .push(variant.clone());
            }
            Op::OpenSession { id, expires_at } => {
                self.sessions.insert(id.clone(), *expires_at);
            }
            Op::CloseSession(id) => {
                self.sessions.remove(id);
            }
            Op::PurgeSessions(now) => {
                self.purge_expired_sessions(*now);
            }
        }
    }

    /// Drop sessions whose expiry has passed.
    pub fn purge_expired_sessions(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, expires_at| now < *expires_at);
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(id: &str, shop: &str) -> Token {
        Token {
            id: id.into(),
            shop_id: shop.into(),
            expiration: Utc::now() + Duration::hours(1),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn variant(owner: &str, key: &ItemKey, ty: &str) -> ItemVariant {
        ItemVariant {
            id: ulid::Ulid::new(),
            key: key.clone(),
            variant_type: ty.into(),
            features: [0.0; 5],
            image_ids: vec![],
            owner: owner.into(),
            request_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cascade_removes_only_owned_rows() {
        let mut t = Tables::default();
        t.tokens.insert("t1".into(), token("t1", "1"));
        t.tokens.insert("t2".into(), token("t2", "2"));
        t.shops.insert("1".into(), "t1".into());
        t.shops.insert("2".into(), "t2".into());
        for (id, owner) in [("i1", "t1"), ("i2", "t1"), ("i3", "t2")] {
            t.images.insert(
                id.into(),
                ImageRecord {
                    id: id.into(),
                    owner: owner.into(),
                    size_bytes: 1,
                    created_at: Utc::now(),
                },
            );
        }
        let k1 = ItemKey::new("1", "a", "red", "M", None);
        let k2 = ItemKey::new("2", "a", "red", "M", None);
        t.items.insert(k1.clone(), vec![variant("t1", &k1, "A"), variant("t1", &k1, "B")]);
        t.items.insert(k2.clone(), vec![variant("t2", &k2, "A")]);

        let cascade = t.cascade_delete_token("t1");
        assert_eq!(cascade.token.unwrap().id, "t1");
        let mut ids = cascade.image_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["i1".to_string(), "i2".to_string()]);
        assert_eq!(cascade.variants_removed, 2);

        assert!(!t.items.contains_key(&k1));
        assert!(t.items.contains_key(&k2));
        assert!(!t.shops.contains_key("1"));
        assert_eq!(t.images.len(), 1);
    }

    #[test]
    fn test_cascade_on_missing_token_is_empty() {
        let mut t = Tables::default();
        assert_eq!(t.cascade_delete_token("nope"), Cascade::default());
    }

    #[test]
    fn test_purge_expired_sessions() {
        let mut t = Tables::default();
        let now = Utc::now();
        t.sessions.insert("old".into(), now - Duration::seconds(1));
        t.sessions.insert("new".into(), now + Duration::hours(1));
        assert_eq!(t.purge_expired_sessions(now), 1);
        assert!(t.sessions.contains_key("new"));
    }

    #[test]
    fn test_update_token_moves_shop_binding() {
        let mut t = Tables::default();
        let original = token("t1", "1");
        t.apply(&Op::CreateToken(original.clone()));

        let mut moved = original;
        moved.shop_id = "2".into();
        t.apply(&Op::UpdateToken {
            previous_shop: "1".into(),
            token: moved,
        });

        assert!(!t.shops.contains_key("1"));
        assert_eq!(t.shops.get("2").map(String::as_str), Some("t1"));
        assert_eq!(t.tokens["t1"].shop_id, "2");
    }

    #[test]
    fn test_apply_delete_token_cascades() {
        let mut t = Tables::default();
        t.apply(&Op::CreateToken(token("t1", "1")));
        let key = ItemKey::new("1", "a", "red", "M", None);
        t.apply(&Op::PushVariant(variant("t1", &key, "A")));
        t.apply(&Op::DeleteToken("t1".into()));
        assert_eq!(t, Tables::default());
    }
}
