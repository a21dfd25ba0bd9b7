use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Bearer credential identifier.
pub type TokenId = String;

/// Shop identifier bound to exactly one token.
pub type ShopId = String;

/// Opaque 12-character image identifier.
pub type ImageId = String;

/// Number of dimensions in a feature vector.
pub const FEATURE_DIMS: usize = 5;

/// Order-significant feature parameters of a variant (`d1` .. `d5`).
pub type FeatureVector = [f64; FEATURE_DIMS];

/// A shop-scoped bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub shop_id: ShopId,
    pub expiration: DateTime<Utc>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// A token is live strictly before its expiration instant.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiration
    }
}

/// Index entry for an uploaded image. The bytes live in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub owner: TokenId,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Which rendition of an image to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    Raw,
    Thumbnail,
    Preview,
}

impl ImageVariant {
    pub const ALL: [ImageVariant; 3] = [
        ImageVariant::Raw,
        ImageVariant::Thumbnail,
        ImageVariant::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::Raw => "raw",
            ImageVariant::Thumbnail => "thumbnail",
            ImageVariant::Preview => "preview",
        }
    }
}

impl std::fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical identity of a catalog item, independent of its feature values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub shop_id: ShopId,
    pub item_id: String,
    pub color: String,
    pub size: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ItemKey {
    pub fn new(
        shop_id: impl Into<String>,
        item_id: impl Into<String>,
        color: impl Into<String>,
        size: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            shop_id: shop_id.into(),
            item_id: item_id.into(),
            color: color.into(),
            size: size.into(),
            description: description.filter(|d| !d.is_empty()),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.shop_id, self.item_id, self.color, self.size
        )?;
        if let Some(ref d) = self.description {
            write!(f, ";{d}")?;
        }
        Ok(())
    }
}

/// One "type" of an item key with its own feature vector and images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemVariant {
    /// Unique per registration; keys the request counter.
    pub id: Ulid,
    pub key: ItemKey,
    #[serde(rename = "type")]
    pub variant_type: String,
    pub features: FeatureVector,
    pub image_ids: Vec<ImageId>,
    pub owner: TokenId,
    /// Served from the request counters; the stored row keeps the value at
    /// registration.
    pub request_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Variants of one item key as shown to the admin, with aggregated counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGroup {
    pub key: ItemKey,
    pub variants: Vec<ItemVariant>,
    pub request_count: u64,
}

/// Per-token summary for the admin token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub token: Token,
    pub live: bool,
    pub images_count: usize,
    pub variants_count: usize,
}
