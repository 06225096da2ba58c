use crate::lifecycle::ControlMessage;
use crate::proxy::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// State for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/message", post(message_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /api/stats: lifecycle and store snapshot.
pub async fn stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.app.lifecycle.status())
}

/// POST /api/message: control messages from the hosting page.
pub async fn message_handler(
    State(state): State<AdminState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let message: ControlMessage = match serde_json::from_value(body) {
        Ok(m) => m,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("unrecognized message: {e}, expected {{\"type\":\"SKIP_WAITING\"}}")
                })),
            );
        }
    };

    let activated = state.app.lifecycle.handle_message(&message);
    tracing::info!(?message, activated, "control message handled");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "activated": activated,
            "active_version": state.app.lifecycle.active().map(|w| w.version().to_string()),
        })),
    )
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateFlow;
    use crate::lifecycle::tests::worker_config;
    use crate::lifecycle::LifecycleManager;
    use crate::network::fake::FakeNetwork;
    use axum::body::Body;
    use axum::http::Request;
    use encore_store::CacheStorage;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn admin() -> (Arc<AppState>, Router) {
        let network = Arc::new(FakeNetwork::new());
        network.ok("/index.html", "<html></html>");
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(CacheStorage::default()),
            network.clone(),
        ));
        let mut v1 = (*worker_config("v1", &["./index.html"])).clone();
        v1.update_flow = UpdateFlow::UserGated;
        lifecycle.install(Arc::new(v1.clone())).await.unwrap();
        let mut v2 = v1;
        v2.version = "v2".into();
        lifecycle.install(Arc::new(v2)).await.unwrap();

        let app = Arc::new(AppState::new(lifecycle, network));
        let router = admin_router(AdminState {
            app: Arc::clone(&app),
            prometheus: None,
        });
        (app, router)
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn stats_report_active_and_waiting() {
        let (_, router) = admin().await;
        let response = router
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = json(response).await;
        assert_eq!(stats["active"]["version"], "v1");
        assert_eq!(stats["active"]["state"], "activated");
        assert_eq!(stats["waiting"]["version"], "v2");
        assert_eq!(stats["waiting"]["state"], "installed");
        assert_eq!(stats["generations"], serde_json::json!(["v1", "v2"]));
    }

    #[tokio::test]
    async fn skip_waiting_message_activates_update() {
        let (app, router) = admin().await;
        let response = router
            .oneshot(post_json("/api/message", r#"{"type":"SKIP_WAITING"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["activated"], true);
        assert_eq!(body["active_version"], "v2");
        assert_eq!(app.lifecycle.storage().keys(), vec!["v2"]);
    }

    #[tokio::test]
    async fn unknown_message_is_rejected() {
        let (app, router) = admin().await;
        let response = router
            .oneshot(post_json("/api/message", r#"{"type":"RELOAD"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.lifecycle.active().unwrap().version(), "v1");
    }
}
