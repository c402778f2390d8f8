//! Handlers that relay to the Copilot API.
//!
//! Each route maps to one fixed upstream path; the inbound path itself is
//! never forwarded.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use crate::AppState;
use crate::error::AppError;
use crate::relay::RelayedRequest;

/// GET /models, GET /v1/models
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let request = RelayedRequest::get("/models", headers);
    Ok(state.relay.forward(request).await?)
}

/// POST /responses, POST /v1/responses
pub async fn responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = RelayedRequest::post("/responses", headers, body);
    Ok(state.relay.forward(request).await?)
}

/// POST /chat/completions, POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = RelayedRequest::post("/chat/completions", headers, body);
    Ok(state.relay.forward(request).await?)
}
