//! Admin console backend: session login and token management.

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{DecetyError, Result, INVALID_TOKEN};
use crate::server::AppState;
use crate::types::{ItemGroup, ShopId, TokenId, TokenSummary};

use super::{ApiError, Envelope};

/// Name of the cookie carrying the admin session id.
pub const SESSION_COOKIE: &str = "uuid";

pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Rejects admin requests that do not carry a live session.
pub async fn require_session(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let session = session_cookie(req.headers());
    match state.gate.require_session(session.as_deref()) {
        Ok(()) => next.run(req).await,
        Err(_) => {
            warn!(path = %req.uri().path(), "admin request without a valid session");
            (StatusCode::UNAUTHORIZED, Envelope::err(INVALID_TOKEN)).into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub login: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> std::result::Result<Response, ApiError> {
    let session = state.gate.login(&form.login, &form.password).await?;
    let cookie = format!("{SESSION_COOKIE}={session}; Path=/; HttpOnly; SameSite=Lax");
    Ok(([(header::SET_COOKIE, cookie)], Envelope::ok("")).into_response())
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    if let Some(session) = session_cookie(&headers) {
        state.gate.logout(&session).await?;
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0");
    Ok(([(header::SET_COOKIE, cookie)], Envelope::ok("")).into_response())
}

#[derive(Debug, Serialize)]
pub struct TokensPage {
    pub tokens: Vec<TokenSummary>,
    pub suggested_token: TokenId,
    pub suggested_shop_id: ShopId,
}

pub async fn list_tokens(
    State(state): State<AppState>,
) -> std::result::Result<Json<Envelope<TokensPage>>, ApiError> {
    Ok(Envelope::ok(TokensPage {
        tokens: state.tokens.list(),
        suggested_token: state.tokens.suggest_token()?,
        suggested_shop_id: state.tokens.suggest_shop_id()?,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenForm {
    /// `create`, `edit` or `delete`.
    pub v: String,
    pub token: String,
    pub shop_id: String,
    pub description: String,
    /// Expiration as unix seconds.
    pub exp_time: String,
}

fn parse_exp_time(raw: &str) -> Result<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| DecetyError::InvalidInput(format!("invalid exp_time: {raw}")))
}

pub async fn modify_token(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> std::result::Result<Json<Envelope<Value>>, ApiError> {
    let result = match form.v.as_str() {
        "create" => {
            let expiration = parse_exp_time(&form.exp_time)?;
            let token = state
                .tokens
                .create(&form.token, &form.shop_id, expiration, &form.description)
                .await?;
            serde_json::to_value(token).map_err(DecetyError::from)?
        }
        "edit" => {
            let expiration = parse_exp_time(&form.exp_time)?;
            let token = state
                .tokens
                .edit(&form.token, &form.shop_id, &form.description, expiration)
                .await
                .map_err(|e| match e {
                    DecetyError::NotFound { key } => {
                        DecetyError::InvalidInput(format!("unknown token {key}"))
                    }
                    other => other,
                })?;
            serde_json::to_value(token).map_err(DecetyError::from)?
        }
        "delete" => {
            let outcome = state.tokens.delete(&form.token).await?;
            serde_json::to_value(outcome).map_err(DecetyError::from)?
        }
        other => {
            return Err(DecetyError::InvalidInput(format!("unknown action: {other}")).into());
        }
    };
    Ok(Envelope::ok(result))
}

pub async fn token_items(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Json<Envelope<Vec<ItemGroup>>> {
    Envelope::ok(state.catalog.list_by_token(&token))
}
