//! GitHub credential lifecycle for the relay.
//!
//! Two credentials are involved:
//! - the durable GitHub OAuth token, obtained once via the device code flow
//!   ([`copilot`]) or discovered locally ([`discovery`]) and persisted by a
//!   [`CredentialStore`];
//! - the short-lived Copilot session token, exchanged from the durable token
//!   and cached by the [`TokenManager`] until shortly before it expires.
//!
//! # Example
//!
//! ```rust,ignore
//! use copilot_relay::config::UpstreamConfig;
//! use copilot_relay::oauth::{DurableCredential, TokenManager};
//!
//! let manager = TokenManager::new(
//!     DurableCredential::new("gho_xxx"),
//!     reqwest::Client::new(),
//!     UpstreamConfig::default(),
//! );
//! let bearer = manager.get_session_token().await?;
//! ```

pub mod copilot;
pub mod discovery;
pub mod storage;
pub mod token;

// Re-exports
pub use copilot::{
    DeviceCodeResponse, DeviceFlowAuthenticator, DeviceFlowError, PollResult, Sleeper,
    TokioSleeper,
};
pub use discovery::{CredentialSource, resolve_durable_credential};
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use token::{Clock, SessionCredential, SystemClock, TokenManager};

use std::fmt;

// =============================================================================
// DurableCredential
// =============================================================================

/// Long-lived GitHub OAuth token.
///
/// Opaque to the relay and never logged: the `Debug` impl only shows a
/// short prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct DurableCredential(String);

impl DurableCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building authorization headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DurableCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(4).collect();
        write!(f, "DurableCredential({prefix}…)")
    }
}

// =============================================================================
// OAuthError
// =============================================================================

/// Errors raised while managing credentials at runtime.
///
/// Device-flow failures have their own type ([`DeviceFlowError`]) because
/// they are process-fatal, whereas everything here is local to one request.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Session token exchange failed. `status` is `None` when the request
    /// never produced an HTTP response.
    #[error("{}", exchange_message(.status, .body))]
    Exchange { status: Option<u16>, body: String },

    /// Credential storage error.
    #[error("Storage error: {0}")]
    Storage(String),
}

fn exchange_message(status: &Option<u16>, body: &str) -> String {
    match status {
        Some(code) => format!("Token exchange failed (HTTP {code}): {body}"),
        None => format!("Token exchange failed: {body}"),
    }
}
