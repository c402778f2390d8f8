//! Copilot session token exchange and caching.
//!
//! The durable GitHub token is traded for a short-lived Copilot session
//! token at `GET {github_api}/copilot_internal/v2/token`. [`TokenManager`]
//! caches the result and only exchanges again once the cached token is
//! inside the expiry skew margin.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use super::{DurableCredential, OAuthError};
use crate::config::UpstreamConfig;

/// A session token is treated as expired this many seconds before its real
/// expiry.
pub const EXPIRY_SKEW_SECS: i64 = 120;

/// Refresh hint used when the exchange response omits `refresh_in`.
const DEFAULT_REFRESH_IN_SECS: u64 = 1500;

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// SessionCredential
// =============================================================================

/// A Copilot session token with its validity window.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Upstream hint for when to refresh proactively. Informational only:
    /// validity is decided by `expires_at` and [`EXPIRY_SKEW_SECS`].
    pub refresh_in: Duration,
}

impl SessionCredential {
    /// Whether the token may still be handed out at `now`. An expiry too
    /// close to the earliest representable time is never valid.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .checked_sub_signed(TimeDelta::seconds(EXPIRY_SKEW_SECS))
            .is_some_and(|cutoff| now < cutoff)
    }
}

#[derive(Deserialize)]
struct ExchangeResponse {
    token: String,
    expires_at: serde_json::Value,
    #[serde(default)]
    refresh_in: Option<u64>,
}

/// Parse `expires_at` from the exchange response.
///
/// Accepts a number or numeric string, in seconds or milliseconds since the
/// epoch (anything past year 2286 in seconds is taken as milliseconds).
fn parse_expires_at(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let secs = if raw > 10_000_000_000 { raw / 1000 } else { raw };
    DateTime::<Utc>::from_timestamp(secs, 0)
}

// =============================================================================
// TokenManager
// =============================================================================

/// Owns the durable credential and hands out valid session tokens.
///
/// The check-and-exchange sequence runs under one async mutex, so at most
/// one exchange is in flight and callers arriving meanwhile wait for its
/// result instead of starting their own. The lock is released before the
/// caller uses the token.
pub struct TokenManager {
    credential: DurableCredential,
    http: reqwest::Client,
    upstream: UpstreamConfig,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<SessionCredential>>,
}

impl TokenManager {
    pub fn new(credential: DurableCredential, http: reqwest::Client, upstream: UpstreamConfig) -> Self {
        Self::with_clock(credential, http, upstream, Arc::new(SystemClock))
    }

    pub fn with_clock(
        credential: DurableCredential,
        http: reqwest::Client,
        upstream: UpstreamConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credential,
            http,
            upstream,
            clock,
            current: Mutex::new(None),
        }
    }

    /// Return a session token valid for at least [`EXPIRY_SKEW_SECS`], exchanging
    /// the durable credential first if needed.
    ///
    /// A failed exchange leaves the cache untouched, so the next call tries
    /// again.
    pub async fn get_session_token(&self) -> Result<String, OAuthError> {
        let mut current = self.current.lock().await;

        let now = self.clock.now();
        if let Some(session) = current.as_ref().filter(|s| s.is_valid_at(now)) {
            return Ok(session.token.clone());
        }

        info!("Exchanging GitHub token for Copilot session token");
        let session = self.exchange(now).await.inspect_err(|e| {
            error!(error = %e, "Token exchange failed");
        })?;

        info!(
            expires_in_secs = (session.expires_at - now).num_seconds(),
            refresh_in_secs = session.refresh_in.as_secs(),
            "Got Copilot session token"
        );

        let token = session.token.clone();
        *current = Some(session);
        Ok(token)
    }

    #[instrument(skip(self), level = "debug")]
    async fn exchange(&self, now: DateTime<Utc>) -> Result<SessionCredential, OAuthError> {
        let url = format!(
            "{}/copilot_internal/v2/token",
            self.upstream.github_api_url.trim_end_matches('/')
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("token {}", self.credential.expose()))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("Editor-Version", &self.upstream.editor_version)
            .header("Editor-Plugin-Version", &self.upstream.editor_plugin_version)
            .header("User-Agent", &self.upstream.user_agent)
            .header("X-GitHub-Api-Version", &self.upstream.api_version)
            .send()
            .await
            .map_err(|e| OAuthError::Exchange {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| OAuthError::Exchange {
            status: Some(status.as_u16()),
            body: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(OAuthError::Exchange {
                status: Some(status.as_u16()),
                body,
            });
        }

        let parsed: ExchangeResponse =
            serde_json::from_str(&body).map_err(|e| OAuthError::Exchange {
                status: Some(status.as_u16()),
                body: format!("unparsable exchange response: {e}"),
            })?;

        let expires_at = parse_expires_at(&parsed.expires_at).ok_or_else(|| OAuthError::Exchange {
            status: Some(status.as_u16()),
            body: format!("invalid expires_at: {}", parsed.expires_at),
        })?;

        Ok(SessionCredential {
            token: parsed.token,
            issued_at: now,
            expires_at,
            refresh_in: Duration::from_secs(parsed.refresh_in.unwrap_or(DEFAULT_REFRESH_IN_SECS)),
        })
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("credential", &self.credential)
            .field("github_api_url", &self.upstream.github_api_url)
            .finish_non_exhaustive()
    }
}
