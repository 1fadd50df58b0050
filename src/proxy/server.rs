// Route assembly and server lifecycle
//
// Four public routes plus a permissive OPTIONS fallback, all behind the CORS
// layer. The server binds, serves until the shutdown signal, and exposes the
// bound address so tests can run against an OS-assigned port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info};

use crate::models::config::Config;
use crate::proxy::handlers::{self, AppState};
use crate::proxy::middleware::cors_layer;

/// Permissive preflight answer for unmatched paths; anything else is 404.
async fn fallback_handler(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Assemble the public router. Only the chat route goes through the
/// admission gate (inside its handler); health, status and models bypass it.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::handle_health))
        .route("/status", get(handlers::health::handle_status))
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .fallback(fallback_handler)
        .layer(cors_layer())
        .with_state(state)
}

// ============================================================================
// GatewayServer
// ============================================================================

pub struct GatewayServer {
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    pub local_addr: SocketAddr,
}

impl GatewayServer {
    /// Bind and start serving. Returns the server handle and the join handle
    /// of the accept loop task.
    pub async fn start(
        cfg: Arc<Config>,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = routes(state);

        let addr = format!("0.0.0.0:{}", cfg.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| e.to_string())?;

        info!("gateway listening on http://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("server error: {}", e);
            }
        });

        Ok((
            Self {
                shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
                local_addr,
            },
            handle,
        ))
    }

    /// Signal graceful shutdown. Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
            info!("gateway shutdown signal sent");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.port = 0; // OS-assigned port
        cfg.default_api_key = "test-key".to_string();
        cfg.anon_token_enabled = false;
        cfg
    }

    async fn start_test_server() -> (GatewayServer, tokio::task::JoinHandle<()>, String) {
        let cfg = Arc::new(test_config());
        let state = AppState::new(cfg.clone());
        let (server, handle) = GatewayServer::start(cfg, state).await.unwrap();
        let base = format!("http://{}", server.local_addr);
        (server, handle, base)
    }

    #[test]
    fn test_routes_build_without_panic() {
        let state = AppState::new(Arc::new(test_config()));
        let _router = routes(state);
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let (server, handle, _base) = start_test_server().await;
        server.stop().await;
        // Stop twice is a no-op.
        server.stop().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint_over_http() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["config"]["max_retries"].is_number());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_endpoint_over_http() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/status", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["current_connections"], 0);
        assert!(body["uptime_seconds"].is_number());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_models_endpoint_over_http() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/v1/models", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_chat_without_auth_is_401() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({
                "model": "GLM-4.5",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Unauthorized");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_cors_headers_present() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/v1/models", base))
            .header("Origin", "https://example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_options_fallback_returns_200() {
        let (server, _handle, base) = start_test_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .request(reqwest::Method::OPTIONS, format!("{}/anything", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(format!("{}/anything", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        server.stop().await;
    }
}
