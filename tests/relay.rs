//! End-to-end tests: the full router in front of a local axum upstream that
//! plays both the GitHub token endpoint and the Copilot API.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use copilot_relay::AppState;
use copilot_relay::api::build_router;
use copilot_relay::config::{Config, UpstreamConfig};
use copilot_relay::net::HttpClient;
use copilot_relay::oauth::{DurableCredential, TokenManager};
use copilot_relay::relay::StreamingRelay;

/// Piece sizes the fake upstream streams `/chat/completions` in.
const STREAM_PIECES: [usize; 5] = [1, 10_000, 3, 4096, 5_000];

// ---------------------------------------------------------------------------
// Fake upstream
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Upstream {
    exchanges: Arc<AtomicUsize>,
    fail_exchange: bool,
    last_headers: Arc<std::sync::Mutex<Option<HeaderMap>>>,
    /// Set when the endless event stream's body is dropped.
    stream_dropped: Arc<AtomicBool>,
}

/// How the fake upstream answers `/chat/completions`.
#[derive(Clone, Copy)]
enum ChatMode {
    Complete,
    FailMidStream,
    Endless,
}

/// Raises its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn stream_payload() -> Vec<u8> {
    let total: usize = STREAM_PIECES.iter().sum();
    (0..total).map(|i| (i % 251) as u8).collect()
}

async fn token(axum::extract::State(up): axum::extract::State<Upstream>) -> Response {
    up.exchanges.fetch_add(1, Ordering::SeqCst);
    if up.fail_exchange {
        return (StatusCode::UNAUTHORIZED, "Bad credentials").into_response();
    }
    Json(json!({
        "token": "session-xyz",
        "expires_at": 4_102_444_800u64,
        "refresh_in": 1500
    }))
    .into_response()
}

async fn chat(
    axum::extract::State(up): axum::extract::State<Upstream>,
    headers: HeaderMap,
) -> Response {
    *up.last_headers.lock().unwrap() = Some(headers);

    let payload = stream_payload();
    let mut offset = 0;
    let pieces: Vec<Result<Bytes, Infallible>> = STREAM_PIECES
        .iter()
        .map(|len| {
            let piece = Bytes::copy_from_slice(&payload[offset..offset + len]);
            offset += len;
            Ok(piece)
        })
        .collect();

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header("x-ratelimit-limit", "100")
        .header("x-upstream-internal", "secret")
        .body(Body::from_stream(stream::iter(pieces)))
        .unwrap()
}

async fn models(
    axum::extract::State(up): axum::extract::State<Upstream>,
    headers: HeaderMap,
) -> Json<Value> {
    *up.last_headers.lock().unwrap() = Some(headers);
    Json(json!({ "data": [{ "id": "gpt-4o" }] }))
}

async fn responses(body: Bytes) -> Response {
    // Echo the request body back so the test can check it arrived intact.
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn broken_stream() -> Response {
    let first = stream::once(async { Ok(Bytes::from_static(b"data: partial\n\n")) });
    let failure = stream::once(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(std::io::Error::other("upstream died"))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(first.chain(failure)))
        .unwrap()
}

async fn endless_stream(axum::extract::State(up): axum::extract::State<Upstream>) -> Response {
    let flag = DropFlag(up.stream_dropped.clone());
    let ticks = stream::unfold(flag, |flag| async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Some((Ok::<_, Infallible>(Bytes::from_static(b"data: tick\n\n")), flag))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(ticks))
        .unwrap()
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_upstream(up: Upstream, mode: ChatMode) -> SocketAddr {
    let chat_route = match mode {
        ChatMode::Complete => post(chat),
        ChatMode::FailMidStream => post(broken_stream),
        ChatMode::Endless => post(endless_stream),
    };
    let router = Router::new()
        .route("/copilot_internal/v2/token", get(token))
        .route("/chat/completions", chat_route)
        .route("/models", get(models))
        .route("/responses", post(responses))
        .with_state(up);
    spawn(router).await
}

// ---------------------------------------------------------------------------
// Relay under test
// ---------------------------------------------------------------------------

async fn spawn_relay(upstream_addr: SocketAddr) -> SocketAddr {
    let upstream = UpstreamConfig::default().with_base_url(&format!("http://{upstream_addr}"));
    let tokens = Arc::new(TokenManager::new(
        DurableCredential::new("gho_test"),
        reqwest::Client::new(),
        upstream.clone(),
    ));
    let relay = StreamingRelay::new(tokens, HttpClient::for_relay(&upstream), upstream.clone());

    let mut config = Config::default();
    config.upstream = upstream;
    let state = AppState {
        config: Arc::new(config),
        relay: Arc::new(relay),
    };
    spawn(build_router(state)).await
}

async fn setup(up: Upstream) -> SocketAddr {
    let upstream_addr = spawn_upstream(up, ChatMode::Complete).await;
    spawn_relay(upstream_addr).await
}

/// Send a raw HTTP/1.1 request and read until the server closes.
async fn raw_request(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(request.as_bytes()).await.unwrap();

    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

/// Split a raw response into its header block and body.
fn split_head(raw: &[u8]) -> (String, &[u8]) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    (
        String::from_utf8_lossy(&raw[..pos]).to_lowercase(),
        &raw[pos + 4..],
    )
}

/// Decode a chunked body. Returns the chunk sizes, the joined payload and
/// whether the terminating zero-length chunk was seen.
fn dechunk(mut body: &[u8]) -> (Vec<usize>, Vec<u8>, bool) {
    let mut sizes = Vec::new();
    let mut data = Vec::new();
    loop {
        let Some(eol) = body.windows(2).position(|w| w == b"\r\n") else {
            return (sizes, data, false);
        };
        let size_line = std::str::from_utf8(&body[..eol]).unwrap();
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
        body = &body[eol + 2..];
        if size == 0 {
            return (sizes, data, true);
        }
        if body.len() < size + 2 {
            data.extend_from_slice(&body[..body.len().min(size)]);
            return (sizes, data, false);
        }
        sizes.push(size);
        data.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

fn post_request(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         X-Initiator: user\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_needs_no_upstream() {
    let up = Upstream::default();
    let relay = setup(up.clone()).await;
    let client = reqwest::Client::new();

    for path in ["/health", "/healthz"] {
        let resp = client
            .get(format!("http://{relay}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({ "status": "ok" }));
    }
    assert_eq!(up.exchanges.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_path_and_wrong_method_are_404() {
    let relay = setup(Upstream::default()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{relay}/foo")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({ "error": "Not found" }));

    let resp = client
        .get(format!("http://{relay}/v1/chat/completions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("http://{relay}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({ "error": "Not found" }));
}

#[tokio::test]
async fn test_streaming_is_chunked_and_byte_exact() {
    let up = Upstream::default();
    let relay = setup(up.clone()).await;

    let raw = raw_request(relay, &post_request("/v1/chat/completions", r#"{"stream":true}"#)).await;
    let (head, body) = split_head(&raw);

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains("transfer-encoding: chunked"));
    assert!(head.contains("content-type: text/event-stream"));
    assert!(head.contains("cache-control: no-cache"));
    assert!(head.contains("x-ratelimit-limit: 100"));
    assert!(!head.contains("x-upstream-internal"));
    assert!(!head.contains("content-length"));

    let (sizes, data, terminated) = dechunk(body);
    assert!(terminated);
    assert!(sizes.iter().all(|s| *s > 0 && *s <= 4096), "{sizes:?}");
    assert_eq!(data, stream_payload());

    let seen = up.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(seen["authorization"], "Bearer session-xyz");
    assert_eq!(seen["copilot-integration-id"], "vscode-chat");
    assert_eq!(seen["x-initiator"], "user");
    assert_eq!(seen["x-github-api-version"], "2025-04-01");
}

#[tokio::test]
async fn test_buffered_response_has_exact_content_length() {
    let relay = setup(Upstream::default()).await;
    let payload = r#"{"model":"gpt-4o","input":"hello"}"#;

    let raw = raw_request(relay, &post_request("/responses", payload)).await;
    let (head, body) = split_head(&raw);

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains(&format!("content-length: {}", payload.len())));
    assert!(!head.contains("transfer-encoding"));
    assert_eq!(body, payload.as_bytes());
}

#[tokio::test]
async fn test_models_route_uses_models_api_version() {
    let up = Upstream::default();
    let relay = setup(up.clone()).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{relay}/v1/models"))
        .header("x-initiator", "agent")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"][0]["id"], "gpt-4o");

    let seen = up.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(seen["x-github-api-version"], "2025-05-01");
    assert_eq!(seen["x-initiator"], "agent");
    assert_eq!(seen["openai-intent"], "conversation-panel");
}

#[tokio::test]
async fn test_session_token_is_reused_across_requests() {
    let up = Upstream::default();
    let relay = setup(up.clone()).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let resp = client
            .get(format!("http://{relay}/models"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(up.exchanges.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exchange_failure_is_502() {
    let up = Upstream {
        fail_exchange: true,
        ..Upstream::default()
    };
    let relay = setup(up.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{relay}/chat/completions"))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("401"), "{message}");
    assert!(message.contains("Bad credentials"), "{message}");
    assert!(up.last_headers.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    // Bind then drop to get a port with nothing listening.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let relay = spawn_relay(dead).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{relay}/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("Token exchange failed"));
}

#[tokio::test]
async fn test_mid_stream_failure_truncates_response() {
    let upstream_addr = spawn_upstream(Upstream::default(), ChatMode::FailMidStream).await;
    let relay = spawn_relay(upstream_addr).await;

    let raw = raw_request(relay, &post_request("/chat/completions", "{}")).await;
    let (head, body) = split_head(&raw);

    assert!(head.starts_with("http/1.1 200"), "{head}");
    let (_, data, terminated) = dechunk(body);
    assert!(!terminated);
    assert!(b"data: partial\n\n".starts_with(&data));
}

#[tokio::test]
async fn test_client_disconnect_drops_upstream_stream() {
    let up = Upstream::default();
    let upstream_addr = spawn_upstream(up.clone(), ChatMode::Endless).await;
    let relay = spawn_relay(upstream_addr).await;

    let mut conn = TcpStream::connect(relay).await.unwrap();
    conn.write_all(post_request("/chat/completions", "{}").as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "relay closed before sending headers");
        head.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200"));
    assert!(!up.stream_dropped.load(Ordering::SeqCst));

    drop(conn);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !up.stream_dropped.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upstream stream still alive after client disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
