use crate::lifecycle::LifecycleManager;
use crate::network::{is_hop_by_hop, Network, NetworkError, RequestDescriptor, ResponseDescriptor};
use crate::router::{RequestRouter, RouteError, Source};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::routing::any;
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub router: RequestRouter,
    pub network: Arc<dyn Network>,
}

impl AppState {
    pub fn new(lifecycle: Arc<LifecycleManager>, network: Arc<dyn Network>) -> Self {
        Self {
            lifecycle,
            router: RequestRouter::new(Arc::clone(&network)),
            network,
        }
    }
}

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main proxy handler. Routes through the active worker, or straight to the
/// network while no worker is active.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };
    let descriptor = RequestDescriptor::from_parts(&parts, body);

    let Some(worker) = state.lifecycle.active() else {
        metrics::counter!("encore_requests_total", "lane" => "uncontrolled", "source" => "pass-through")
            .increment(1);
        return match state.network.fetch(&descriptor).await {
            Ok(response) => build_response(response, "BYPASS", "uncontrolled"),
            Err(e) => network_error_response(&e),
        };
    };

    let url = descriptor.url.clone();
    match state.router.route(&worker, descriptor).await {
        Ok(routed) => {
            metrics::counter!(
                "encore_requests_total",
                "lane" => routed.lane.as_str(),
                "source" => routed.source.as_str()
            )
            .increment(1);
            tracing::debug!(
                url = %url,
                lane = routed.lane.as_str(),
                source = routed.source.as_str(),
                status = routed.response.status.as_u16(),
                latency_us = start.elapsed().as_micros() as u64,
                "request routed"
            );
            let x_cache = match routed.source {
                Source::Cache | Source::ShellFallback => "HIT",
                Source::Network => "MISS",
                Source::PassThrough => "BYPASS",
            };
            build_response(routed.response, x_cache, routed.lane.as_str())
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "request failed with no fallback");
            route_error_response(&e)
        }
    }
}

/// Build an HTTP response from a routed response, dropping hop-by-hop headers.
fn build_response(routed: ResponseDescriptor, x_cache: &'static str, lane: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(routed.body));
    *response.status_mut() = routed.status;

    let headers = response.headers_mut();
    for (key, value) in routed.headers.iter() {
        if !is_hop_by_hop(key.as_str()) {
            headers.append(key, value.clone());
        }
    }
    headers.insert("x-cache", HeaderValue::from_static(x_cache));
    headers.insert("x-route-lane", HeaderValue::from_static(lane));
    response
}

fn error_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn network_error_response(e: &NetworkError) -> Response<Body> {
    tracing::warn!(error = %e, "upstream request failed");
    match e {
        NetworkError::Timeout(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"),
        _ => error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
    }
}

fn route_error_response(e: &RouteError) -> Response<Body> {
    if e.is_timeout() {
        error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
    } else {
        error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::worker_config;
    use crate::network::fake::FakeNetwork;
    use encore_store::CacheStorage;
    use tower::ServiceExt;

    async fn app(install: bool) -> (Arc<FakeNetwork>, Router) {
        let network = Arc::new(FakeNetwork::new());
        network
            .ok("/index.html", "<html>shell</html>")
            .ok("/style.css", "body{}");
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(CacheStorage::default()),
            network.clone(),
        ));
        if install {
            lifecycle
                .install(worker_config("v1", &["./index.html", "./style.css"]))
                .await
                .unwrap();
        }
        let state = Arc::new(AppState::new(lifecycle, network.clone()));
        (network, proxy_router(state))
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn uncontrolled_requests_bypass_router() {
        let (network, app) = app(false).await;
        network.ok("/icons/a.png", "PNG");

        let response = app.oneshot(get("/icons/a.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "BYPASS");
        assert_eq!(response.headers()["x-route-lane"], "uncontrolled");
    }

    #[tokio::test]
    async fn offline_navigation_renders_shell() {
        let (network, app) = app(true).await;
        network.set_offline(true);

        let request = Request::builder()
            .uri("/?song=sancarlo")
            .header("sec-fetch-mode", "navigate")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.headers()["x-route-lane"], "critical");
        assert_eq!(body_text(response).await, "<html>shell</html>");
    }

    #[tokio::test]
    async fn media_miss_then_hit() {
        let (network, app) = app(true).await;
        network.ok("/mp3/a.mp3", "AUDIO");

        let first = app.clone().oneshot(get("/mp3/a.mp3")).await.unwrap();
        assert_eq!(first.headers()["x-cache"], "MISS");
        let second = app.oneshot(get("/mp3/a.mp3")).await.unwrap();
        assert_eq!(second.headers()["x-cache"], "HIT");
        assert_eq!(body_text(second).await, "AUDIO");
        assert_eq!(network.calls_for("/mp3/a.mp3"), 1);
    }

    #[tokio::test]
    async fn unrecoverable_failure_is_bad_gateway() {
        let (network, app) = app(true).await;
        network.set_offline(true);

        let response = app.oneshot(get("/lrc/song1.lrc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
