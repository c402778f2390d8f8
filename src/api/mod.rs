pub mod health;
pub mod proxy;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use crate::AppState;
use crate::error::AppError;

/// Build the relay router.
///
/// Route layout:
/// ```text
/// /health, /healthz                       GET   (local)
/// /models, /v1/models                     GET   -> upstream /models
/// /responses, /v1/responses               POST  -> upstream /responses
/// /chat/completions, /v1/chat/completions POST  -> upstream /chat/completions
/// ```
///
/// Anything else, including a known path with the wrong method, is 404.
pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.server.max_body_bytes);

    Router::new()
        .route("/health", get(health::health_check).fallback(not_found))
        .route("/healthz", get(health::health_check).fallback(not_found))
        .route("/models", get(proxy::list_models).fallback(not_found))
        .route("/v1/models", get(proxy::list_models).fallback(not_found))
        .route("/responses", post(proxy::responses).fallback(not_found))
        .route("/v1/responses", post(proxy::responses).fallback(not_found))
        .route("/chat/completions", post(proxy::chat_completions).fallback(not_found))
        .route("/v1/chat/completions", post(proxy::chat_completions).fallback(not_found))
        .fallback(not_found)
        .layer(body_limit)
        .with_state(state)
}

async fn not_found() -> AppError {
    AppError::NotFound
}
