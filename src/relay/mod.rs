//! Forwarding of client requests to the Copilot API.
//!
//! Each relayed request gets a fresh session token from the
//! [`TokenManager`], the fixed Copilot identity headers, and its own upstream
//! connection. Event-stream responses are passed through incrementally in
//! frames of at most [`MAX_FRAME`](crate::net::rechunk::MAX_FRAME) bytes with
//! chunked transfer-encoding; everything else is buffered and sent with a
//! `Content-Length`.
//!
//! Once a streamed response has started, an upstream failure can no longer
//! become an error status: the body stream yields the error and the HTTP
//! layer drops the connection without the terminating chunk, so the client
//! sees a truncated stream.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::net::{HttpClient, Rechunk};
use crate::oauth::OAuthError;
use crate::oauth::TokenManager;

/// Inbound headers forwarded upstream unchanged.
pub const PASSTHROUGH_HEADERS: [&str; 1] = ["x-initiator"];

/// Upstream response headers copied to the client besides `Content-Type`.
pub const COPIED_RESPONSE_HEADERS: [&str; 3] = [
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
];

const EVENT_STREAM: &str = "text/event-stream";

/// Upstream path served under the newer API version.
const MODELS_PATH: &str = "/models";

// =============================================================================
// Types
// =============================================================================

/// A client request reduced to what is sent upstream.
#[derive(Debug, Clone)]
pub struct RelayedRequest {
    pub method: Method,
    /// Path on the Copilot API, e.g. `/chat/completions`.
    pub path: &'static str,
    /// Inbound headers; only [`PASSTHROUGH_HEADERS`] are used.
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RelayedRequest {
    pub fn get(path: &'static str, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            path,
            headers,
            body: None,
        }
    }

    pub fn post(path: &'static str, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            path,
            headers,
            body: Some(body),
        }
    }
}

/// Failures that happen before any response byte reaches the client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Auth(#[from] OAuthError),

    #[error("Upstream request failed: {0}")]
    Upstream(reqwest::Error),

    #[error("Failed to read upstream response: {0}")]
    Body(reqwest::Error),
}

// =============================================================================
// StreamingRelay
// =============================================================================

/// Sends [`RelayedRequest`]s to the Copilot API and turns the upstream answer
/// into a client response.
pub struct StreamingRelay {
    tokens: Arc<TokenManager>,
    http: HttpClient,
    upstream: UpstreamConfig,
}

impl StreamingRelay {
    pub fn new(tokens: Arc<TokenManager>, http: HttpClient, upstream: UpstreamConfig) -> Self {
        Self {
            tokens,
            http,
            upstream,
        }
    }

    /// Relay one request.
    ///
    /// The upstream status is passed through whatever it is; only failures
    /// to obtain a token, connect, or read a buffered body are errors.
    pub async fn forward(&self, request: RelayedRequest) -> Result<Response, RelayError> {
        let session = self.tokens.get_session_token().await?;

        let url = format!(
            "{}{}",
            self.upstream.copilot_api_url.trim_end_matches('/'),
            request.path
        );
        let api_version = if request.path == MODELS_PATH {
            &self.upstream.models_api_version
        } else {
            &self.upstream.api_version
        };

        let mut builder = self
            .http
            .inner()
            .request(request.method.clone(), &url)
            .bearer_auth(&session)
            .header(header::CONTENT_TYPE, "application/json")
            .header("Copilot-Integration-Id", &self.upstream.integration_id)
            .header("Editor-Version", &self.upstream.editor_version)
            .header("Editor-Plugin-Version", &self.upstream.editor_plugin_version)
            .header(header::USER_AGENT, &self.upstream.user_agent)
            .header("OpenAI-Intent", "conversation-panel")
            .header("X-GitHub-Api-Version", api_version);

        for name in PASSTHROUGH_HEADERS {
            if let Some(value) = request.headers.get(name) {
                builder = builder.header(name, value.clone());
            }
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        debug!(method = %request.method, url = %url, "Relaying request upstream");

        let upstream = builder.send().await.map_err(|e| {
            warn!(path = request.path, error = %e, "Upstream request failed");
            RelayError::Upstream(e)
        })?;

        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        let streaming = content_type
            .to_str()
            .is_ok_and(|ct| ct.contains(EVENT_STREAM));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type);
        for name in COPIED_RESPONSE_HEADERS {
            if let Some(value) = upstream.headers().get(name) {
                headers.insert(HeaderName::from_static(name), value.clone());
            }
        }

        info!(
            method = %request.method,
            path = request.path,
            status = status.as_u16(),
            streaming,
            "Upstream responded"
        );

        let body = if streaming {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            let path = request.path;
            let frames = Rechunk::new(upstream.bytes_stream()).inspect_err(move |e| {
                warn!(path, error = %e, "Upstream stream failed mid-response, aborting");
            });
            Body::from_stream(frames)
        } else {
            let bytes = upstream.bytes().await.map_err(|e| {
                warn!(path = request.path, error = %e, "Failed to read upstream body");
                RelayError::Body(e)
            })?;
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            Body::from(bytes)
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

impl std::fmt::Debug for StreamingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRelay")
            .field("copilot_api_url", &self.upstream.copilot_api_url)
            .finish_non_exhaustive()
    }
}
