//! Weighted nearest-variant selection.

use crate::types::{FeatureVector, ItemVariant, FEATURE_DIMS};

/// Per-dimension weights of the matching distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights(pub [f64; FEATURE_DIMS]);

impl Weights {
    pub const UNIFORM: Weights = Weights([1.0; FEATURE_DIMS]);
}

/// `Σ w_i (a_i - b_i)^2`. No square root: only the ordering matters.
#[inline]
pub fn weighted_distance(a: &FeatureVector, b: &FeatureVector, weights: &Weights) -> f64 {
    a.iter()
        .zip(b.iter())
        .zip(weights.0.iter())
        .map(|((x, y), w)| {
            let d = x - y;
            w * d * d
        })
        .sum()
}

/// Selects the variant nearest to a query among those whose owning token is
/// still live.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    weights: Weights,
}

impl Matcher {
    pub fn new(weights: Weights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Nearest live variant, `None` when the list is empty or no owner is live.
    /// Ties keep the earliest variant in enumeration order.
    pub fn best_match<'a, F>(
        &self,
        variants: &'a [ItemVariant],
        query: &FeatureVector,
        is_live: F,
    ) -> Option<&'a ItemVariant>
    where
        F: Fn(&str) -> bool,
    {
        let mut best: Option<(&ItemVariant, f64)> = None;
        for variant in variants.iter().filter(|v| is_live(&v.owner)) {
            let dist = weighted_distance(query, &variant.features, &self.weights);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((variant, dist)),
            }
        }
        best.map(|(v, _)| v)
    }
}
