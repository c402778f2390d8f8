//! Upstream HTTP client construction.

use std::time::Duration;
use reqwest::{Client, ClientBuilder};

use crate::config::UpstreamConfig;

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-read timeout. Applies to waiting for response headers and to
/// each body read, not to the whole exchange, so long streams survive.
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Thin wrapper over a configured [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    /// Create a new builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Client for relayed traffic: upstream timeouts from config, and no idle
    /// connection reuse so each inbound request gets its own connection.
    pub fn for_relay(upstream: &UpstreamConfig) -> Self {
        Self::builder()
            .user_agent(&upstream.user_agent)
            .connect_timeout(upstream.timeout())
            .read_timeout(upstream.timeout())
            .no_connection_reuse()
            .build()
    }

    /// Client for GitHub auth endpoints (device flow and token exchange).
    pub fn for_auth(upstream: &UpstreamConfig) -> Self {
        Self::builder()
            .user_agent(&upstream.user_agent)
            .connect_timeout(Duration::from_secs(15))
            .request_timeout(Duration::from_secs(15))
            .build()
    }

    /// Get the inner reqwest client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    builder: ClientBuilder,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            builder: Client::builder()
                .user_agent(concat!("copilot-relay/", env!("CARGO_PKG_VERSION")))
                .connect_timeout(CONNECT_TIMEOUT)
                .read_timeout(READ_TIMEOUT),
        }
    }
}

impl HttpClientBuilder {
    /// Set a custom user agent.
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.builder = self.builder.user_agent(ua);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.connect_timeout(timeout);
        self
    }

    /// Set the per-read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.read_timeout(timeout);
        self
    }

    /// Set a total request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.timeout(timeout);
        self
    }

    /// Close every connection once its response is done.
    pub fn no_connection_reuse(mut self) -> Self {
        self.builder = self.builder.pool_max_idle_per_host(0);
        self
    }

    /// Build the client.
    pub fn build(self) -> HttpClient {
        let inner = match self.builder.build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to build HTTP client with custom config: {}; using defaults", e);
                Client::default()
            }
        };
        HttpClient { inner }
    }
}
