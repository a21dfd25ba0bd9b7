//! Commit log: one immutable entry per committed transaction.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{DecetyError, Result};
use crate::types::{ImageRecord, ItemVariant, ShopId, Token, TokenId};

/// Prefix all log entries are written under.
pub const LOG_PREFIX: &str = "catalog/log/";

/// A row-level change. Applying the same sequence of operations to the same
/// state always yields the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a token and bind its shop.
    CreateToken(Token),
    /// Replace a token, moving its shop binding from `previous_shop`.
    UpdateToken { previous_shop: ShopId, token: Token },
    /// Remove a token together with everything it owns.
    DeleteToken(TokenId),
    PutImage(ImageRecord),
    PushVariant(ItemVariant),
    OpenSession {
        id: String,
        expires_at: DateTime<Utc>,
    },
    CloseSession(String),
    PurgeSessions(DateTime<Utc>),
}

/// The operations of one transaction, tagged with the generation they produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub generation: u64,
    pub written_at: DateTime<Utc>,
    pub ops: Vec<Op>,
    /// xxh3 of the bincode-encoded operations.
    pub checksum: u64,
}

impl LogEntry {
    pub fn new(generation: u64, ops: Vec<Op>) -> Result<Self> {
        let checksum = Self::compute_checksum(&ops)?;
        Ok(Self {
            generation,
            written_at: Utc::now(),
            ops,
            checksum,
        })
    }

    fn compute_checksum(ops: &[Op]) -> Result<u64> {
        Ok(xxh3_64(&bincode::serialize(ops)?))
    }

    pub fn validate_checksum(&self) -> Result<()> {
        let expected = Self::compute_checksum(&self.ops)?;
        if self.checksum != expected {
            return Err(DecetyError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let entry: Self = bincode::deserialize(data)?;
        entry.validate_checksum()?;
        Ok(entry)
    }

    /// Object key of the entry producing `generation`. Zero padding keeps
    /// lexical and numeric order identical.
    pub fn object_key(generation: u64) -> String {
        format!("{LOG_PREFIX}{generation:020}.log")
    }

    /// Inverse of [`object_key`](Self::object_key); `None` for foreign keys.
    pub fn generation_of(key: &str) -> Option<u64> {
        key.strip_prefix(LOG_PREFIX)?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }
}
