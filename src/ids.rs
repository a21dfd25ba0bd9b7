//! Random opaque identifiers with collision-free allocation.

use rand::Rng;

use crate::error::{DecetyError, Result};

pub const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const ID_LENGTH: usize = 12;
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;

/// Upper bound (exclusive) for suggested numeric shop ids.
pub const SHOP_ID_RANGE: u32 = 10_000;

/// Draws fixed-length identifiers uniformly from a fixed alphabet.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    alphabet: &'static [u8],
    length: usize,
    max_attempts: usize,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            alphabet: ID_ALPHABET,
            length: ID_LENGTH,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl IdGenerator {
    pub fn new(alphabet: &'static [u8], length: usize, max_attempts: usize) -> Self {
        assert!(!alphabet.is_empty(), "alphabet must not be empty");
        Self {
            alphabet,
            length,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One random draw, without any uniqueness check.
    pub fn draw(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())] as char)
            .collect()
    }

    /// Draw until `exists` rejects the candidate.
    pub fn next<F>(&self, mut exists: F) -> Result<String>
    where
        F: FnMut(&str) -> bool,
    {
        for _ in 0..self.max_attempts {
            let candidate = self.draw();
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DecetyError::ExhaustedIdentifierSpace {
            attempts: self.max_attempts,
        })
    }

    /// Random decimal shop id below [`SHOP_ID_RANGE`] that `exists` rejects.
    pub fn next_shop_id<F>(&self, mut exists: F) -> Result<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(0..SHOP_ID_RANGE).to_string();
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DecetyError::ExhaustedIdentifierSpace {
            attempts: self.max_attempts,
        })
    }
}
