//! copilot-relay -- local OpenAI-style endpoint backed by GitHub Copilot.
//!
//! This is the application entry point. It wires together:
//!   - Configuration loading
//!   - Durable GitHub credential discovery (or the device flow)
//!   - Session token validation
//!   - The HTTP relay server
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use copilot_relay::AppState;
use copilot_relay::api;
use copilot_relay::config::Config;
use copilot_relay::net::HttpClient;
use copilot_relay::oauth::discovery::{TOKEN_ENV_VAR, copilot_config_dirs};
use copilot_relay::oauth::{
    DeviceCodeResponse, DeviceFlowAuthenticator, FileCredentialStore, TokenManager,
    resolve_durable_credential,
};
use copilot_relay::relay::StreamingRelay;

const DEFAULT_CONFIG_FILE: &str = "copilot-relay.toml";

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    token: Option<String>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        config_path: None,
        port: None,
        token: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                cli.config_path = Some(PathBuf::from(require_value(&arg, args.next())));
            }
            "--port" | "-p" => {
                let value = require_value(&arg, args.next());
                match value.parse() {
                    Ok(port) => cli.port = Some(port),
                    Err(_) => {
                        eprintln!("Error: invalid port: {value}");
                        std::process::exit(1);
                    }
                }
            }
            "--token" | "-t" => {
                cli.token = Some(require_value(&arg, args.next()));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("copilot-relay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
    }

    cli
}

fn require_value(flag: &str, value: Option<String>) -> String {
    match value {
        Some(v) => v,
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        "\
copilot-relay {version} -- GitHub Copilot relay for OpenAI-style clients

USAGE:
    copilot-relay [OPTIONS]

OPTIONS:
    -p, --port <PORT>      Port to listen on [default: 4141]
    -t, --token <TOKEN>    GitHub OAuth token to use instead of stored credentials
    -c, --config <PATH>    Path to configuration file [default: {config}]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    COPILOT_RELAY_CONFIG   Alternative to --config flag
    {token_env}       GitHub OAuth token, used when nothing is stored
",
        version = env!("CARGO_PKG_VERSION"),
        config = DEFAULT_CONFIG_FILE,
        token_env = TOKEN_ENV_VAR,
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();

    // --config beats COPILOT_RELAY_CONFIG
    let config_path = cli
        .config_path
        .or_else(|| std::env::var_os("COPILOT_RELAY_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    // 2. Load configuration
    let mut config = Config::load(&config_path)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // 3. Initialize tracing/logging
    init_tracing(&config);
    for (setting, env_var) in config.env_overrides.all() {
        tracing::info!(setting = %setting, env = %env_var, "Setting overridden by environment");
    }

    // 4. Resolve the durable GitHub credential
    let store = Arc::new(FileCredentialStore::new(config.storage.token_file.clone()));
    let auth_http = HttpClient::for_auth(&config.upstream);

    let credential = match resolve_durable_credential(
        cli.token.as_deref(),
        store.as_ref(),
        std::env::var(TOKEN_ENV_VAR).ok(),
        &copilot_config_dirs(),
    ) {
        Some((credential, source)) => {
            tracing::info!(source = %source, "Using GitHub credential");
            credential
        }
        None => {
            println!("No GitHub token found. Starting device flow login...");
            let authenticator = DeviceFlowAuthenticator::new(
                auth_http.inner().clone(),
                config.upstream.clone(),
                store.clone(),
            );
            match authenticator.authenticate(&mut print_device_code).await {
                Ok(credential) => {
                    println!("Authenticated. Token saved to {}", store.path().display());
                    credential
                }
                Err(e) => {
                    tracing::error!(error = %e, "Device flow failed");
                    eprintln!("Error: {e}");
                    std::process::exit(e.exit_code());
                }
            }
        }
    };

    // 5. Validate the credential with one session token exchange
    let tokens = Arc::new(TokenManager::new(
        credential,
        auth_http.inner().clone(),
        config.upstream.clone(),
    ));
    if let Err(e) = tokens.get_session_token().await {
        tracing::error!(error = %e, "Failed to obtain a Copilot session token");
        eprintln!("Error: {e}");
        eprintln!(
            "If the stored token is stale, delete {} and restart to log in again.",
            store.path().display()
        );
        std::process::exit(1);
    }

    // 6. Build shared state and the router
    let relay = StreamingRelay::new(
        tokens,
        HttpClient::for_relay(&config.upstream),
        config.upstream.clone(),
    );
    let state = AppState {
        config: Arc::new(config),
        relay: Arc::new(relay),
    };
    let app = build_app(state.clone());

    // 7. Bind and serve
    let listen_addr = state.config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  copilot-relay v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  API:     http://{listen_addr}/v1/");
    println!("  Health:  http://{listen_addr}/health");
    println!();
    println!("  Codex config (~/.codex/config.toml):");
    println!();
    println!("    model_provider = \"copilot\"");
    println!();
    println!("    [model_providers.copilot]");
    println!("    name = \"GitHub Copilot\"");
    println!("    base_url = \"http://{listen_addr}/v1\"");
    println!("    wire_api = \"responses\"");
    println!();

    // 8. Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down gracefully");
    Ok(())
}

fn print_device_code(device: &DeviceCodeResponse) {
    println!();
    println!("  Open:  {}", device.verification_uri);
    println!("  Code:  {}", device.user_code);
    println!();
    println!("Waiting for authorization...");
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Wrap the relay router with the global middleware stack.
fn build_app(state: AppState) -> Router {
    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // -- Tracing layer --------------------------------------------------------
    let trace = TraceLayer::new_for_http();

    api::build_router(state)
        .layer(propagate_id)
        .layer(trace)
        .layer(request_id)
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("copilot_relay={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
