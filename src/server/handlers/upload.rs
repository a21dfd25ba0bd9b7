use axum::extract::{Multipart, State};
use axum::Json;
use bytes::Bytes;

use crate::error::DecetyError;
use crate::server::AppState;
use crate::types::ImageId;

use super::{ApiError, Envelope};

/// Multipart field names accepted for the image payload.
const FILE_FIELDS: [&str; 3] = ["file", "data", "image"];

pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Envelope<ImageId>>, ApiError> {
    let mut token: Option<String> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DecetyError::InvalidInput(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "token" {
            let value = field
                .text()
                .await
                .map_err(|e| DecetyError::InvalidInput(e.to_string()))?;
            token = Some(value);
        } else if FILE_FIELDS.contains(&name.as_str()) && data.is_none() {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| DecetyError::InvalidInput(e.to_string()))?;
            data = Some(bytes);
        }
    }

    let token = token.unwrap_or_default();
    state.gate.require_live_token(&token)?;
    let data = data.ok_or_else(|| DecetyError::InvalidInput("missing image payload".into()))?;
    if !state.limiter.try_acquire() {
        return Err(DecetyError::FloodLimit.into());
    }

    let id = state.images.upload(&token, data).await?;
    Ok(Envelope::ok(id))
}
