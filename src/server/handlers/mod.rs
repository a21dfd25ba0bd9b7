pub mod admin;
pub mod health;
pub mod images;
pub mod items;
pub mod metrics;
pub mod upload;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::DecetyError;

/// Response envelope of the JSON routes. `error` is empty on success and
/// `result` is omitted on failure.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(result: T) -> Json<Self> {
        Json(Self {
            error: "",
            result: Some(result),
        })
    }
}

impl Envelope<()> {
    pub fn err(code: &'static str) -> Json<Self> {
        Json(Self {
            error: code,
            result: None,
        })
    }
}

/// Wrapper that converts `DecetyError` into an HTTP response.
pub struct ApiError(pub DecetyError);

impl From<DecetyError> for ApiError {
    fn from(e: DecetyError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(code) = self.0.wire_code() {
            if !matches!(self.0, DecetyError::FloodLimit) {
                tracing::debug!(error = %self.0, code, "request rejected");
            }
            return (StatusCode::OK, Envelope::err(code)).into_response();
        }
        match self.0 {
            DecetyError::NotFound { .. } => StatusCode::NOT_FOUND.into_response(),
            e => {
                tracing::error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
