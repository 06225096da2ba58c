use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Size of each synthetic audio file.
const SONG_BYTES: usize = 256 * 1024;

static LYRIC_EDITS: AtomicU64 = AtomicU64::new(0);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><link rel="stylesheet" href="./style.css"><link rel="manifest" href="./manifest.json"></head>
<body><h1>Encore Player</h1><div id="updateBanner" class="hidden"></div><script src="./script.js"></script></body>
</html>
"#;

const STYLE_CSS: &str = "body { font-family: sans-serif; }\n.hidden { display: none; }\n";

const SCRIPT_JS: &str = "fetch('tracks.json').then(r => r.json()).then(t => console.log(t.length + ' tracks'));\n";

async fn simulate_latency() {
    // Simulate upstream latency (5-20ms)
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

fn text(content_type: &'static str, body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn index() -> Response {
    simulate_latency().await;
    text("text/html; charset=utf-8", INDEX_HTML)
}

async fn style() -> Response {
    simulate_latency().await;
    text("text/css", STYLE_CSS)
}

async fn script() -> Response {
    simulate_latency().await;
    text("application/javascript", SCRIPT_JS)
}

async fn manifest() -> Json<Value> {
    Json(json!({
        "name": "Encore Player",
        "start_url": "./",
        "display": "standalone",
        "icons": [
            { "src": "./icons/icon-192.png", "sizes": "192x192", "type": "image/png" },
            { "src": "./icons/icon-512.png", "sizes": "512x512", "type": "image/png" }
        ]
    }))
}

async fn tracks() -> Json<Value> {
    simulate_latency().await;
    let tracks: Vec<Value> = (1..=5)
        .map(|i| {
            json!({
                "title": format!("Song {i}"),
                "audio": format!("song{i}.mp3"),
                "cover": format!("song{i}.jpg"),
                "lrc": format!("song{i}.lrc"),
            })
        })
        .collect();
    Json(Value::Array(tracks))
}

async fn icon(Path(name): Path<String>) -> Response {
    // Not a real PNG; the bytes only need to be stable per name.
    ([(header::CONTENT_TYPE, "image/png")], format!("PNG:{name}")).into_response()
}

/// Deterministic audio bytes so repeated fetches are byte-identical.
fn song_bytes(name: &str) -> Vec<u8> {
    let seed = name.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..SONG_BYTES).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Parse `bytes=start-end` (end optional) or the suffix form `bytes=-n`
/// against a body of `len` bytes.
fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let last = len.checked_sub(1)?;
    if start.trim().is_empty() {
        let suffix: usize = end.trim().parse().ok()?;
        return (suffix > 0).then(|| (len.saturating_sub(suffix), last));
    }
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => last,
        e => e.parse::<usize>().ok()?.min(last),
    };
    (start <= end).then_some((start, end))
}

async fn song(Path(file): Path<String>, headers: HeaderMap) -> Response {
    simulate_latency().await;
    if !file.ends_with(".mp3") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = song_bytes(&file);
    let len = body.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, len));

    match range {
        Some(Some((start, end))) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}")),
            ],
            body[start..=end].to_vec(),
        )
            .into_response(),
        Some(None) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{len}"))],
        )
            .into_response(),
        None => (
            [
                (header::CONTENT_TYPE, "audio/mpeg"),
                (header::ACCEPT_RANGES, "bytes"),
            ],
            body,
        )
            .into_response(),
    }
}

/// Lyrics change on every request, so a stale copy is easy to spot.
async fn lyrics(Path(file): Path<String>) -> Response {
    let edit = LYRIC_EDITS.fetch_add(1, Ordering::Relaxed);
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("[ti:{file}]\n[00:00.00]edit {edit}\n"),
    )
        .into_response()
}

async fn health() -> &'static str {
    "ok"
}

fn app() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/style.css", get(style))
        .route("/script.js", get(script))
        .route("/manifest.json", get(manifest))
        .route("/tracks.json", get(tracks))
        .route("/icons/{name}", get(icon))
        .route("/mp3/{file}", get(song))
        .route("/lrc/{file}", get(lyrics))
        .route("/health", get(health))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo backend starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind demo backend to {addr}: {e}"));
    if let Err(e) = axum::serve(listener, app()).await {
        tracing::error!(error = %e, "demo backend error");
    }
}
