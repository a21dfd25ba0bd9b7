use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::server::AppState;
use crate::types::ImageVariant;

use super::ApiError;

async fn serve(state: &AppState, id: &str, variant: ImageVariant) -> Result<Response, ApiError> {
    let bytes = state.images.fetch(id, variant).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}

pub async fn get_raw(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    serve(&state, &id, ImageVariant::Raw).await
}

pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    serve(&state, &id, ImageVariant::Thumbnail).await
}

pub async fn get_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    serve(&state, &id, ImageVariant::Preview).await
}
