//! Locating an existing durable GitHub token before falling back to the
//! device flow.
//!
//! Sources, first match wins:
//! 1. `--token` on the command line
//! 2. the relay's own token file ([`CredentialStore`])
//! 3. the `GH_COPILOT_TOKEN` environment variable
//! 4. `hosts.json` / `apps.json` written by editor Copilot extensions

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::DurableCredential;
use super::storage::CredentialStore;
use crate::config::xdg_config_dir;

/// Environment variable consulted after the token file.
pub const TOKEN_ENV_VAR: &str = "GH_COPILOT_TOKEN";

const THIRD_PARTY_FILES: [&str; 2] = ["hosts.json", "apps.json"];

/// Where a durable credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Stored,
    Environment,
    ThirdParty(PathBuf),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "command line"),
            Self::Stored => write!(f, "saved token file"),
            Self::Environment => write!(f, "{TOKEN_ENV_VAR}"),
            Self::ThirdParty(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Entry in hosts.json or apps.json keyed by hostname.
#[derive(Debug, Deserialize)]
struct HostEntry {
    #[serde(default)]
    oauth_token: Option<String>,
}

/// Directories where editor extensions keep their Copilot config.
pub fn copilot_config_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(config) = xdg_config_dir() {
        found.push(config.join("github-copilot"));
    }
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            found.push(
                home.join("Library")
                    .join("Application Support")
                    .join("github-copilot"),
            );
        }
    }
    found
}

/// Walk the sources in precedence order.
///
/// `env_token` is the value of [`TOKEN_ENV_VAR`], passed in by the caller.
/// Unreadable or malformed files are skipped. Returns `None` when nothing
/// was found and the device flow should run.
pub fn resolve_durable_credential(
    explicit: Option<&str>,
    store: &dyn CredentialStore,
    env_token: Option<String>,
    config_dirs: &[PathBuf],
) -> Option<(DurableCredential, CredentialSource)> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        info!("Using token from command line");
        return Some((DurableCredential::new(token), CredentialSource::Explicit));
    }

    match store.load() {
        Ok(Some(credential)) => {
            info!(store = store.name(), "Using saved token");
            return Some((credential, CredentialSource::Stored));
        }
        Ok(None) => debug!(store = store.name(), "No saved token"),
        Err(e) => warn!(store = store.name(), error = %e, "Ignoring unreadable token file"),
    }

    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        info!("Using token from {TOKEN_ENV_VAR} env var");
        return Some((
            DurableCredential::new(token.trim()),
            CredentialSource::Environment,
        ));
    }

    for dir in config_dirs {
        for name in THIRD_PARTY_FILES {
            let path = dir.join(name);
            if let Some(token) = read_host_token(&path) {
                info!(path = %path.display(), "Using token from Copilot extension config");
                return Some((DurableCredential::new(token), CredentialSource::ThirdParty(path)));
            }
        }
    }

    None
}

/// Read the `github.com` OAuth token from an extension config file.
///
/// ```json
/// { "github.com": { "oauth_token": "gho_xxxxxxxxxxxx", "user": "octocat" } }
/// ```
///
/// Newer `apps.json` files key entries as `github.com:<client id>`; those
/// match too.
fn read_host_token(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let hosts: HashMap<String, HostEntry> = match serde_json::from_str(&content) {
        Ok(h) => h,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping malformed Copilot config");
            return None;
        }
    };

    let exact = hosts.get("github.com");
    let prefixed = || {
        hosts
            .iter()
            .filter(|(host, _)| host.starts_with("github.com:"))
            .map(|(_, entry)| entry)
            .find(|entry| entry.oauth_token.as_deref().is_some_and(|t| !t.is_empty()))
    };

    exact
        .filter(|entry| entry.oauth_token.as_deref().is_some_and(|t| !t.is_empty()))
        .or_else(prefixed)
        .and_then(|entry| entry.oauth_token.clone())
}
