//! Persistence for the durable GitHub credential.
//!
//! Provides the [`CredentialStore`] trait and two implementations:
//! - [`FileCredentialStore`] - a single JSON file `{"github_token": "..."}`
//! - [`MemoryCredentialStore`] - in-memory storage for tests
//!
//! The relay reads the store once at startup and writes it once when the
//! device flow succeeds; nothing else touches it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{DurableCredential, OAuthError};

// =============================================================================
// CredentialStore trait
// =============================================================================

/// Trait for durable credential storage backends.
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any.
    fn load(&self) -> Result<Option<DurableCredential>, OAuthError>;

    /// Persist a credential, replacing any previous one.
    fn save(&self, credential: &DurableCredential) -> Result<(), OAuthError>;

    /// Get the name of this storage backend.
    fn name(&self) -> &str;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn load(&self) -> Result<Option<DurableCredential>, OAuthError> {
        (**self).load()
    }
    fn save(&self, credential: &DurableCredential) -> Result<(), OAuthError> {
        (**self).save(credential)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// On-disk document layout.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    github_token: Option<String>,
}

// =============================================================================
// FileCredentialStore
// =============================================================================

/// File permissions for the token file (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory permissions (Unix only): owner read/write/execute.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// JSON file credential store.
///
/// # Security
/// - The file is created with 0600 permissions on Unix
/// - A missing parent directory is created with 0700 permissions
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the token file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<(), OAuthError> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() || dir.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(dir).map_err(|e| {
            OAuthError::Storage(format!(
                "Failed to create token directory '{}': {}",
                dir.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            std::fs::set_permissions(dir, perms).map_err(|e| {
                OAuthError::Storage(format!(
                    "Failed to set directory permissions on '{}': {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<Option<DurableCredential>, OAuthError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OAuthError::Storage(format!(
                    "Failed to read token file '{}': {}",
                    self.path.display(),
                    e
                )));
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        let file: TokenFile = serde_json::from_str(&content).map_err(|e| {
            OAuthError::Storage(format!(
                "Failed to parse token file '{}': {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(file
            .github_token
            .filter(|t| !t.is_empty())
            .map(DurableCredential::new))
    }

    #[instrument(skip(self, credential), fields(path = %self.path.display()))]
    fn save(&self, credential: &DurableCredential) -> Result<(), OAuthError> {
        self.ensure_parent_dir()?;

        let content = serde_json::to_string(&TokenFile {
            github_token: Some(credential.expose().to_string()),
        })
        .map_err(|e| OAuthError::Storage(format!("Failed to serialize token: {}", e)))?;

        // Temp file + rename so a crash never leaves a half-written token.
        // On Unix the temp file is created 0600 so the token is never
        // readable by other users, even briefly.
        let temp_path = self.path.with_extension("tmp");

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(FILE_MODE)
                .open(&temp_path)
                .map_err(|e| {
                    OAuthError::Storage(format!(
                        "Failed to create temp file '{}': {}",
                        temp_path.display(),
                        e
                    ))
                })?;
            file.write_all(content.as_bytes()).map_err(|e| {
                OAuthError::Storage(format!(
                    "Failed to write temp file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().map_err(|e| {
                OAuthError::Storage(format!(
                    "Failed to sync temp file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&temp_path, &content).map_err(|e| {
                OAuthError::Storage(format!(
                    "Failed to write temp file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(OAuthError::Storage(format!(
                "Failed to rename '{}' to '{}': {}",
                temp_path.display(),
                self.path.display(),
                e
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

// =============================================================================
// MemoryCredentialStore
// =============================================================================

/// In-memory credential store.
///
/// Clones share state, so a test can hand one clone to the code under test
/// and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<RwLock<Option<DurableCredential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a credential.
    pub fn with_credential(credential: DurableCredential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(credential))),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<DurableCredential>, OAuthError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| OAuthError::Storage("memory store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, credential: &DurableCredential) -> Result<(), OAuthError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| OAuthError::Storage("memory store lock poisoned".into()))?;
        *guard = Some(credential.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
