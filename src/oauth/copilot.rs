//! GitHub Device Code flow (RFC 8628) for the Copilot OAuth app.
//!
//! Obtains the durable GitHub token without a browser redirect:
//!
//! 1. Request a device code from GitHub
//! 2. Show the user the verification URL and the code to enter there
//! 3. Poll GitHub until the user completes (or refuses) authorization
//! 4. Persist the access token through the [`CredentialStore`]
//!
//! # Endpoints
//! - Device code: `{github_base}/login/device/code`
//! - Token: `{github_base}/login/oauth/access_token`
//!
//! Waiting between polls goes through a [`Sleeper`] so tests can drive the
//! loop without wall-clock delays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::DurableCredential;
use super::storage::CredentialStore;
use crate::config::UpstreamConfig;

/// Poll interval used when GitHub does not send one.
const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Added to the poll interval on every `slow_down` response.
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

// =============================================================================
// Sleeper
// =============================================================================

/// Waits between poll attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real-time sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Response from the device code request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    /// The device code used for polling.
    pub device_code: String,
    /// The code the user must enter at the verification URL.
    pub user_code: String,
    /// The URL where the user enters the code.
    pub verification_uri: String,
    /// Seconds until the device code expires, when GitHub says.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Minimum seconds between poll attempts.
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

#[derive(Serialize)]
struct DeviceCodeRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Serialize)]
struct TokenPollRequest<'a> {
    client_id: &'a str,
    device_code: &'a str,
    grant_type: &'a str,
}

/// Response from the token polling endpoint.
#[derive(Deserialize)]
struct TokenPollResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Classification of a single poll attempt.
#[derive(Debug, PartialEq)]
pub enum PollResult {
    /// Authorization complete.
    Authorized(DurableCredential),
    /// User hasn't completed authorization yet, keep polling.
    Pending,
    /// Server asked us to slow down, increase interval.
    SlowDown,
    /// The device code expired.
    Expired,
    /// The user refused authorization.
    Denied,
    /// Unrecognised error or transport failure; keep polling.
    Retry(String),
}

// =============================================================================
// DeviceFlowError
// =============================================================================

/// Terminal device-flow failures. All of them end the process.
#[derive(Debug, thiserror::Error)]
pub enum DeviceFlowError {
    #[error("Device code request failed: {0}")]
    RequestFailed(String),

    #[error("Device code expired. Please try again.")]
    Expired,

    #[error("Authorization denied by user.")]
    Denied,
}

impl DeviceFlowError {
    /// Process exit status for this failure; distinct per variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RequestFailed(_) => 3,
            Self::Expired => 4,
            Self::Denied => 5,
        }
    }
}

// =============================================================================
// DeviceFlowAuthenticator
// =============================================================================

/// Runs the device authorization flow and stores the resulting token.
pub struct DeviceFlowAuthenticator {
    http: reqwest::Client,
    upstream: UpstreamConfig,
    store: Arc<dyn CredentialStore>,
    sleeper: Arc<dyn Sleeper>,
}

impl DeviceFlowAuthenticator {
    pub fn new(http: reqwest::Client, upstream: UpstreamConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self::with_sleeper(http, upstream, store, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        http: reqwest::Client,
        upstream: UpstreamConfig,
        store: Arc<dyn CredentialStore>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            http,
            upstream,
            store,
            sleeper,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.upstream.github_base_url.trim_end_matches('/'), path)
    }

    /// Run the whole flow.
    ///
    /// `on_code` is called once with the device code so the caller can tell
    /// the user where to go; this then blocks until a terminal state.
    pub async fn authenticate(
        &self,
        on_code: &mut dyn FnMut(&DeviceCodeResponse),
    ) -> Result<DurableCredential, DeviceFlowError> {
        info!("Starting GitHub device flow authentication");

        let device = self.request_device_code().await?;
        on_code(&device);
        info!("Waiting for authorization");

        let credential = self.poll_until_complete(&device).await?;

        match self.store.save(&credential) {
            Ok(()) => info!(store = self.store.name(), "Authenticated, token saved"),
            Err(e) => warn!(error = %e, "Authenticated, but the token could not be saved"),
        }

        Ok(credential)
    }

    /// Request a device code from GitHub.
    pub async fn request_device_code(&self) -> Result<DeviceCodeResponse, DeviceFlowError> {
        let response = self
            .http
            .post(self.endpoint("/login/device/code"))
            .header("Accept", "application/json")
            .json(&DeviceCodeRequest {
                client_id: &self.upstream.client_id,
                scope: "read:user",
            })
            .send()
            .await
            .map_err(|e| DeviceFlowError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeviceFlowError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(DeviceFlowError::RequestFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let device: DeviceCodeResponse = serde_json::from_str(&body).map_err(|e| {
            DeviceFlowError::RequestFailed(format!("Failed to parse device code response: {}", e))
        })?;

        debug!(
            user_code = %device.user_code,
            verification_uri = %device.verification_uri,
            expires_in = ?device.expires_in,
            interval = device.interval,
            "Device code obtained"
        );

        Ok(device)
    }

    /// Poll the token endpoint once and classify the answer.
    pub async fn poll_once(&self, device: &DeviceCodeResponse) -> PollResult {
        let response = match self
            .http
            .post(self.endpoint("/login/oauth/access_token"))
            .header("Accept", "application/json")
            .json(&TokenPollRequest {
                client_id: &self.upstream.client_id,
                device_code: &device.device_code,
                grant_type: DEVICE_GRANT_TYPE,
            })
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return PollResult::Retry(e.to_string()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return PollResult::Retry(e.to_string()),
        };

        let Ok(poll) = serde_json::from_str::<TokenPollResponse>(&body) else {
            return PollResult::Retry(format!("unparsable poll response (HTTP {})", status.as_u16()));
        };

        if let Some(token) = poll.access_token.filter(|t| !t.is_empty()) {
            return PollResult::Authorized(DurableCredential::new(token));
        }

        match poll.error.as_deref() {
            Some("authorization_pending") => PollResult::Pending,
            Some("slow_down") => PollResult::SlowDown,
            Some("expired_token") => PollResult::Expired,
            Some("access_denied") => PollResult::Denied,
            Some(other) => PollResult::Retry(format!(
                "{} - {}",
                other,
                poll.error_description.unwrap_or_default()
            )),
            None => PollResult::Retry(format!("unexpected poll response (HTTP {})", status.as_u16())),
        }
    }

    /// Poll until the flow reaches a terminal state.
    ///
    /// Sleeps `interval + 1` seconds before every poll and adds
    /// [`SLOW_DOWN_INCREMENT`] on each `slow_down`. When GitHub stated an
    /// `expires_in`, the flow also ends once that much time has been spent
    /// waiting.
    pub async fn poll_until_complete(
        &self,
        device: &DeviceCodeResponse,
    ) -> Result<DurableCredential, DeviceFlowError> {
        let mut interval = Duration::from_secs(device.interval.saturating_add(1));
        let deadline = device.expires_in.map(Duration::from_secs);
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            if deadline.is_some_and(|limit| waited >= limit) {
                error!(attempt, "Device code expired locally before authorization");
                return Err(DeviceFlowError::Expired);
            }

            self.sleeper.sleep(interval).await;
            waited = waited.saturating_add(interval);
            attempt += 1;

            match self.poll_once(device).await {
                PollResult::Authorized(credential) => {
                    info!(attempt, "Device flow completed");
                    return Ok(credential);
                }
                PollResult::Pending => {
                    debug!(attempt, "Device flow pending, continuing to poll");
                }
                PollResult::SlowDown => {
                    interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                    debug!(?interval, "Slowing down poll interval");
                }
                PollResult::Expired => {
                    error!("Device code expired. Please try again.");
                    return Err(DeviceFlowError::Expired);
                }
                PollResult::Denied => {
                    error!("Authorization denied by user.");
                    return Err(DeviceFlowError::Denied);
                }
                PollResult::Retry(reason) => {
                    debug!(attempt, %reason, "Poll failed, retrying");
                }
            }
        }
    }
}
