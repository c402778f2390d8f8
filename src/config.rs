use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings were overridden by environment
/// variables, so startup logging can say where a value came from.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest inbound request body the relay will buffer.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Upstream endpoints and the client identity presented to them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Copilot API that relayed requests go to.
    #[serde(default = "default_copilot_api_url")]
    pub copilot_api_url: String,
    /// GitHub REST API hosting the session token exchange.
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
    /// GitHub web host serving the device flow endpoints.
    #[serde(default = "default_github_base_url")]
    pub github_base_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Bound on connecting and on each read from the upstream.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_editor_version")]
    pub editor_version: String,
    #[serde(default = "default_editor_plugin_version")]
    pub editor_plugin_version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_integration_id")]
    pub integration_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// `/models` is served under a newer API version than everything else.
    #[serde(default = "default_models_api_version")]
    pub models_api_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            copilot_api_url: default_copilot_api_url(),
            github_api_url: default_github_api_url(),
            github_base_url: default_github_base_url(),
            client_id: default_client_id(),
            timeout_secs: default_timeout_secs(),
            editor_version: default_editor_version(),
            editor_plugin_version: default_editor_plugin_version(),
            user_agent: default_user_agent(),
            integration_id: default_integration_id(),
            api_version: default_api_version(),
            models_api_version: default_models_api_version(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Point every upstream at a single base URL. Used by tests that stand
    /// up one mock server for GitHub and Copilot alike.
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.copilot_api_url = base.clone();
        self.github_api_url = base.clone();
        self.github_base_url = base;
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    4141
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_copilot_api_url() -> String {
    "https://api.githubcopilot.com".to_string()
}
fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_github_base_url() -> String {
    "https://github.com".to_string()
}
fn default_client_id() -> String {
    "Iv1.b507a08c87ecfe98".to_string()
}
const fn default_timeout_secs() -> u64 {
    300
}
fn default_editor_version() -> String {
    "vscode/1.96.0".to_string()
}
fn default_editor_plugin_version() -> String {
    "copilot-chat/0.26.7".to_string()
}
fn default_user_agent() -> String {
    "GitHubCopilotChat/0.26.7".to_string()
}
fn default_integration_id() -> String {
    "vscode-chat".to_string()
}
fn default_api_version() -> String {
    "2025-04-01".to_string()
}
fn default_models_api_version() -> String {
    "2025-05-01".to_string()
}
fn default_token_file() -> PathBuf {
    xdg_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("copilot-relay")
        .join("token.json")
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. A missing file is not an error: defaults are used.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Apply `COPILOT_RELAY_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Every applied
    /// setting is recorded in `env_overrides`.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
                }
            };
        }

        // -- Server --
        env_str!("server.host", "COPILOT_RELAY_HOST", self.server.host);
        env_parse!("server.port", "COPILOT_RELAY_PORT", self.server.port);
        env_parse!(
            "server.max_body_bytes",
            "COPILOT_RELAY_MAX_BODY_BYTES",
            self.server.max_body_bytes
        );

        // -- Upstream --
        env_str!(
            "upstream.copilot_api_url",
            "COPILOT_RELAY_COPILOT_API_URL",
            self.upstream.copilot_api_url
        );
        env_str!(
            "upstream.github_api_url",
            "COPILOT_RELAY_GITHUB_API_URL",
            self.upstream.github_api_url
        );
        env_str!(
            "upstream.github_base_url",
            "COPILOT_RELAY_GITHUB_BASE_URL",
            self.upstream.github_base_url
        );
        env_str!("upstream.client_id", "COPILOT_RELAY_CLIENT_ID", self.upstream.client_id);
        env_parse!(
            "upstream.timeout_secs",
            "COPILOT_RELAY_TIMEOUT_SECS",
            self.upstream.timeout_secs
        );

        // -- Storage --
        env_path!("storage.token_file", "COPILOT_RELAY_TOKEN_FILE", self.storage.token_file);

        // -- Logging --
        env_str!("logging.level", "COPILOT_RELAY_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "COPILOT_RELAY_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

/// `$XDG_CONFIG_HOME`, falling back to `~/.config`, on every platform.
/// Unlike `dirs::config_dir()`, macOS resolves to the same place.
pub fn xdg_config_dir() -> Option<PathBuf> {
    config_dir_from(std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from), dirs::home_dir())
}

fn config_dir_from(xdg: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    xdg.filter(|p| !p.as_os_str().is_empty())
        .or_else(|| home.map(|h| h.join(".config")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
