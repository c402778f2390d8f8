pub mod api;
pub mod config;
pub mod error;
pub mod net;
pub mod oauth;
pub mod relay;

use crate::config::Config;
use crate::relay::StreamingRelay;

use std::sync::Arc;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<StreamingRelay>,
}
