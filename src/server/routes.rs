use std::time::Duration;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{admin, health, images, items, metrics, upload};
use super::AppState;

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    crate::metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    response
}

fn api_routes(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/tokens", get(admin::list_tokens).post(admin::modify_token))
        .route("/tokens/:token/items", get(admin::token_items))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_session,
        ))
        .route("/login", post(admin::login))
        .route("/logout", post(admin::logout));

    Router::new()
        .route("/upload", post(upload::upload_image))
        .route("/update", get(items::update_item).post(items::update_item))
        .route("/get", get(items::get_item).post(items::get_item))
        .route("/image/:id", get(images::get_raw))
        .route("/image/:id/thumbnail", get(images::get_thumbnail))
        .route("/image/:id/preview", get(images::get_preview))
        .nest("/dc-admin-p", admin)
}

pub fn build_router(state: AppState) -> Router {
    let prefix = state.config.server.prefix.trim_end_matches('/').to_string();
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let body_limit = state.config.server.max_upload_bytes;

    let api = api_routes(&state);
    let router = Router::new()
        .route("/healthz", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler));
    let router = if prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(&prefix, api)
    };

    router
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
