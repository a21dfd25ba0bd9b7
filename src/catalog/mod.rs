//! Item keys, their type variants, and nearest-variant matching.

pub mod counters;
pub mod index;
pub mod matcher;

pub use counters::{flush_loop, RequestCounters};
pub use index::{CatalogIndex, MatchResult, VariantDraft};
pub use matcher::{weighted_distance, Matcher, Weights};
