use std::collections::HashMap;

use axum::extract::State;
use axum::{Form, Json};

use crate::catalog::{MatchResult, VariantDraft};
use crate::error::{DecetyError, Result};
use crate::server::AppState;
use crate::types::{FeatureVector, ImageId, ItemKey, FEATURE_DIMS};

use super::{ApiError, Envelope};

type Params = HashMap<String, String>;

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str> {
    match params.get(name).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DecetyError::InvalidInput(format!("missing parameter {name}"))),
    }
}

fn item_key(params: &Params, shop_id: &str) -> Result<ItemKey> {
    Ok(ItemKey::new(
        shop_id,
        required(params, "id")?,
        required(params, "color")?,
        required(params, "size")?,
        params.get("description").map(|d| d.trim().to_string()),
    ))
}

fn features(params: &Params, names: &[String]) -> Result<FeatureVector> {
    let mut out = [0.0; FEATURE_DIMS];
    for (slot, name) in out.iter_mut().zip(names) {
        let raw = required(params, name)?;
        *slot = raw
            .parse()
            .map_err(|_| DecetyError::InvalidInput(format!("{name} is not a number: {raw}")))?;
    }
    Ok(out)
}

fn image_ids(params: &Params) -> Result<Vec<ImageId>> {
    Ok(required(params, "image_ids")?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Register a new variant under the caller's shop.
pub async fn update_item(
    State(state): State<AppState>,
    Form(params): Form<Params>,
) -> std::result::Result<Json<Envelope<&'static str>>, ApiError> {
    let token = params.get("token").map(String::as_str).unwrap_or_default();
    state.gate.require_live_token(token)?;
    let shop_id = state.tokens.shop_of(token).map_err(|e| match e {
        DecetyError::NotFound { .. } => DecetyError::Unauthorized,
        other => other,
    })?;

    let draft = VariantDraft {
        key: item_key(&params, &shop_id)?,
        variant_type: required(&params, "type")?.to_string(),
        features: features(&params, &state.config.catalog.param_names)?,
        image_ids: image_ids(&params)?,
    };
    state.catalog.check_registration(token, &draft)?;

    if !state.limiter.try_acquire() {
        return Err(DecetyError::FloodLimit.into());
    }
    state.catalog.register_variant(token, draft).await?;
    Ok(Envelope::ok(""))
}

/// Answer the closest registered variant for a feature query.
pub async fn get_item(
    State(state): State<AppState>,
    Form(params): Form<Params>,
) -> std::result::Result<Json<Envelope<MatchResult>>, ApiError> {
    let shop_id = required(&params, "shop_id")?;
    let key = item_key(&params, shop_id)?;
    let query = features(&params, &state.config.catalog.param_names)?;

    let result = state.catalog.match_item(&key, &query)?;
    Ok(Envelope::ok(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn names() -> Vec<String> {
        ["d1", "d2", "d3", "d4", "d5"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_features_in_param_order() {
        let p = params(&[("d5", "5"), ("d1", "1"), ("d3", "3.5"), ("d2", "2"), ("d4", "-4")]);
        assert_eq!(features(&p, &names()).unwrap(), [1.0, 2.0, 3.5, -4.0, 5.0]);
    }

    #[test]
    fn test_missing_or_bad_feature() {
        let p = params(&[("d1", "1"), ("d2", "2"), ("d3", "3"), ("d4", "4")]);
        assert!(matches!(features(&p, &names()), Err(DecetyError::InvalidInput(_))));

        let p = params(&[("d1", "x"), ("d2", "2"), ("d3", "3"), ("d4", "4"), ("d5", "5")]);
        assert!(matches!(features(&p, &names()), Err(DecetyError::InvalidInput(_))));
    }

    #[test]
    fn test_image_ids_split() {
        let p = params(&[("image_ids", "abc, def,,ghi")]);
        assert_eq!(image_ids(&p).unwrap(), vec!["abc", "def", "ghi"]);
    }

    #[test]
    fn test_item_key_optional_description() {
        let p = params(&[("id", "item-1"), ("color", "red"), ("size", "M"), ("description", "")]);
        let key = item_key(&p, "1234").unwrap();
        assert_eq!(key, ItemKey::new("1234", "item-1", "red", "M", None));
    }
}
