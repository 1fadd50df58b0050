// OpenAI surface - /v1/chat/completions and /v1/models
//
// The chat handler is the per-request orchestrator: admission, auth, parse,
// feature-flag resolution, token acquisition, upstream dispatch, and the
// hand-off to the streaming translator or the aggregating collector. All
// counter updates and telemetry records for the request happen here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::models::config::{Config, UPSTREAM_MODEL_ID};
use crate::proxy::common::{
    client_ip, generate_chat_id, generate_message_id, generate_request_id, mask_api_key,
};
use crate::proxy::mappers::openai::collector::{build_response, collect_content};
use crate::proxy::mappers::openai::models::{ChatCompletionRequest, ModelInfo, ModelList};
use crate::proxy::mappers::openai::streaming::{create_sse_stream, StreamOptions};
use crate::proxy::telemetry;
use crate::proxy::upstream::models::{
    BackgroundTasks, Features, ModelItem, UpstreamRequest,
};
use crate::proxy::upstream::token::acquire_bearer;

use super::AppState;

pub const SEARCH_MCP_SERVER: &str = "deep-web-search";

// ============================================================================
// Error envelope
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    performance_mode: Option<&'static str>,
}

impl ErrorBody {
    fn simple(error: &str) -> Self {
        Self {
            error: error.to_string(),
            details: None,
            retry_after: None,
            performance_mode: None,
        }
    }
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

// ============================================================================
// Model feature routing
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ModelFeatures {
    pub thinking: bool,
    pub search: bool,
    /// Search MCP server id; empty for non-search models. Sent to the
    /// upstream as the sole element of `mcp_servers` either way.
    pub search_mcp: String,
}

/// Map the public model name onto upstream feature flags. Unknown names get
/// the default model's behavior.
pub(crate) fn resolve_model_features(model: &str, cfg: &Config) -> ModelFeatures {
    if model == cfg.thinking_model_name {
        ModelFeatures {
            thinking: true,
            search: false,
            search_mcp: String::new(),
        }
    } else if model == cfg.search_model_name {
        ModelFeatures {
            thinking: true,
            search: true,
            search_mcp: SEARCH_MCP_SERVER.to_string(),
        }
    } else {
        ModelFeatures {
            thinking: false,
            search: false,
            search_mcp: String::new(),
        }
    }
}

/// Build the upstream request. The upstream is always asked to stream; the
/// client's stream flag only decides how we shape the response.
pub(crate) fn build_upstream_request(
    chat_req: &ChatCompletionRequest,
    features: ModelFeatures,
    chat_id: String,
    message_id: String,
) -> UpstreamRequest {
    let mut variables = HashMap::new();
    variables.insert("{{USER_NAME}}".to_string(), "User".to_string());
    variables.insert("{{USER_LOCATION}}".to_string(), "Unknown".to_string());
    variables.insert(
        "{{CURRENT_DATETIME}}".to_string(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    );

    UpstreamRequest {
        stream: true,
        model: UPSTREAM_MODEL_ID.to_string(),
        messages: chat_req.messages.clone(),
        params: HashMap::new(),
        features: Features {
            enable_thinking: features.thinking,
            web_search: features.search,
            auto_web_search: features.search,
        },
        background_tasks: BackgroundTasks::default(),
        chat_id,
        id: message_id,
        mcp_servers: vec![features.search_mcp],
        model_item: ModelItem {
            id: UPSTREAM_MODEL_ID.to_string(),
            name: "GLM-4.5".to_string(),
            owned_by: "openai".to_string(),
        },
        tool_servers: Vec::new(),
        variables,
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

// ============================================================================
// POST /v1/chat/completions
// ============================================================================

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Bytes, axum::extract::rejection::BytesRejection>,
) -> Response {
    let started = Instant::now();

    // Admission first: a saturated gate rejects synchronously, before any
    // counter or upstream work.
    let Some(permit) = state.gate.try_acquire() else {
        debug!(
            "admission gate saturated, rejecting ({} in flight)",
            state.counters.current_connections()
        );
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody::simple("Server too busy, please try again later"),
        );
    };

    state.counters.record_request();
    let request_id = generate_request_id();
    let ip = client_ip(&headers, Some(peer));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let cfg = state.cfg.clone();

    // Body extraction failure surfaces here so the counters still see it.
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            state.counters.record_error();
            let elapsed = started.elapsed().as_millis() as u64;
            state.counters.record_response_time_ms(elapsed);
            telemetry::log_response(
                &cfg,
                &request_id,
                400,
                elapsed,
                "",
                0,
                &format!("Failed to read request body: {}", e),
            );
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorBody::simple("Failed to read request body"),
            );
        }
    };

    // Client credential check.
    let presented = bearer_from_headers(&headers);
    if presented.as_deref() != Some(cfg.default_api_key.as_str()) {
        state.counters.record_error();
        let elapsed = started.elapsed().as_millis() as u64;
        state.counters.record_response_time_ms(elapsed);
        telemetry::log_response(&cfg, &request_id, 401, elapsed, "", 0, "Unauthorized");
        return error_response(StatusCode::UNAUTHORIZED, ErrorBody::simple("Unauthorized"));
    }

    // Decode the client request.
    let chat_req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            state.counters.record_error();
            let elapsed = started.elapsed().as_millis() as u64;
            state.counters.record_response_time_ms(elapsed);
            telemetry::log_response(
                &cfg,
                &request_id,
                400,
                elapsed,
                "",
                0,
                &format!("Invalid JSON format: {}", e),
            );
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorBody::simple("Invalid JSON format"),
            );
        }
    };

    let is_stream = chat_req.wants_stream();
    debug!(
        "[{}] chat request: model={} stream={} messages={}",
        request_id,
        chat_req.model,
        is_stream,
        chat_req.messages.len()
    );

    telemetry::log_request(
        &cfg,
        &request_id,
        &ip,
        &mask_api_key(&cfg.default_api_key),
        &chat_req.model,
        chat_req.messages.len(),
        json!({
            "stream": chat_req.stream,
            "temperature": chat_req.temperature,
            "max_tokens": chat_req.max_tokens,
        }),
        if cfg.log_user_messages {
            serde_json::to_value(&chat_req.messages).ok()
        } else {
            None
        },
        user_agent.as_deref(),
    );

    // Session ids and upstream request.
    let chat_id = generate_chat_id();
    let message_id = generate_message_id();
    let features = resolve_model_features(&chat_req.model, &cfg);
    let upstream_req =
        build_upstream_request(&chat_req, features, chat_id.clone(), message_id);

    // Fresh anonymous token when enabled; configured token otherwise.
    let bearer = acquire_bearer(&cfg, state.upstream.http()).await;

    let deadline = tokio::time::Instant::now() + cfg.deadline_for(is_stream);

    let response = match state
        .upstream
        .dispatch(&upstream_req, &chat_id, &bearer, deadline)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            state.counters.record_error();
            let elapsed = started.elapsed().as_millis() as u64;
            state.counters.record_response_time_ms(elapsed);
            telemetry::log_response(
                &cfg,
                &request_id,
                502,
                elapsed,
                "upstream",
                cfg.max_retries,
                &e.to_string(),
            );
            return error_response(
                StatusCode::BAD_GATEWAY,
                ErrorBody {
                    error: "External API request failed".to_string(),
                    details: Some(e.to_string()),
                    retry_after: Some(60),
                    performance_mode: Some(cfg.performance_mode.as_str()),
                },
            );
        }
    };

    if is_stream {
        stream_response(state, cfg, response, chat_req, request_id, started, deadline, permit)
    } else {
        let content = collect_content(
            response.bytes_stream(),
            cfg.think_tags_mode,
            deadline,
        )
        .await;
        let elapsed = started.elapsed().as_millis() as u64;
        state.counters.record_response_time_ms(elapsed);
        telemetry::log_response(&cfg, &request_id, 200, elapsed, "upstream", 0, "");
        drop(permit);
        Json(build_response(&chat_req.model, content)).into_response()
    }
}

/// Records the response-time counter and the closing telemetry record on
/// drop, so a stream torn down mid-flight (client disconnect, task
/// cancellation) is accounted exactly like one that ran to completion.
struct StreamAccounting {
    cfg: std::sync::Arc<Config>,
    counters: std::sync::Arc<crate::proxy::monitor::Counters>,
    request_id: String,
    started: Instant,
}

impl Drop for StreamAccounting {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.counters.record_response_time_ms(elapsed);
        telemetry::log_response(&self.cfg, &self.request_id, 200, elapsed, "upstream", 0, "");
    }
}

/// Shape the SSE response: the translated stream wrapped with final-path
/// accounting. The admission permit and the accounting guard ride inside
/// the body task so the slot is released and the counters updated however
/// the stream ends.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    cfg: std::sync::Arc<Config>,
    upstream_response: reqwest::Response,
    chat_req: ChatCompletionRequest,
    request_id: String,
    started: Instant,
    deadline: tokio::time::Instant,
    permit: crate::proxy::admission::AdmissionPermit,
) -> Response {
    let translated = create_sse_stream(
        upstream_response.bytes_stream(),
        StreamOptions {
            model: chat_req.model.clone(),
            think_tags_mode: cfg.think_tags_mode,
            deadline,
            connection_check_interval: if cfg.disable_connection_check {
                None
            } else {
                Some(cfg.connection_check_interval)
            },
        },
    );

    let accounting = StreamAccounting {
        cfg,
        counters: state.counters.clone(),
        request_id,
        started,
    };
    let accounted = async_stream::stream! {
        let _permit = permit;
        let _accounting = accounting;
        let mut translated = translated;
        while let Some(frame) = translated.next().await {
            yield frame;
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(accounted))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============================================================================
// GET /v1/models
// ============================================================================

pub async fn handle_list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .cfg
        .public_model_names()
        .iter()
        .map(|name| ModelInfo {
            id: name.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "z.ai".to_string(),
        })
        .collect();
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_state(max_concurrent: usize) -> AppState {
        let mut cfg = Config::from_env();
        cfg.max_concurrent_connections = max_concurrent;
        cfg.default_api_key = "test-key".to_string();
        cfg.anon_token_enabled = false;
        AppState::new(Arc::new(cfg))
    }

    fn peer() -> ConnectInfo<SocketAddr> {
        ConnectInfo("127.0.0.1:4000".parse().unwrap())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_resolve_model_features_default() {
        let cfg = Config::from_env();
        let f = resolve_model_features("GLM-4.5", &cfg);
        assert!(!f.thinking);
        assert!(!f.search);
        assert!(f.search_mcp.is_empty());

        // Unknown names behave like the default model.
        let f = resolve_model_features("gpt-4o", &cfg);
        assert!(!f.thinking);
    }

    #[test]
    fn test_resolve_model_features_thinking() {
        let cfg = Config::from_env();
        let f = resolve_model_features("GLM-4.5-Thinking", &cfg);
        assert!(f.thinking);
        assert!(!f.search);
        assert!(f.search_mcp.is_empty());
    }

    #[test]
    fn test_resolve_model_features_search() {
        let cfg = Config::from_env();
        let f = resolve_model_features("GLM-4.5-Search", &cfg);
        assert!(f.thinking);
        assert!(f.search);
        assert_eq!(f.search_mcp, SEARCH_MCP_SERVER);
    }

    #[test]
    fn test_build_upstream_request_shape() {
        let chat_req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"GLM-4.5-Search","messages":[{"role":"user","content":"hi"}],"stream":false}"#,
        )
        .unwrap();
        let cfg = Config::from_env();
        let features = resolve_model_features(&chat_req.model, &cfg);
        let req = build_upstream_request(&chat_req, features, "chat-1".into(), "msg-1".into());

        // Always streaming toward the upstream, regardless of the client.
        assert!(req.stream);
        assert_eq!(req.model, UPSTREAM_MODEL_ID);
        assert_eq!(req.chat_id, "chat-1");
        assert_eq!(req.id, "msg-1");
        assert!(req.features.enable_thinking);
        assert!(req.features.web_search);
        assert!(req.features.auto_web_search);
        assert_eq!(req.mcp_servers, vec![SEARCH_MCP_SERVER.to_string()]);
        assert!(!req.background_tasks.title_generation);
        assert!(req.variables.contains_key("{{USER_NAME}}"));
        assert!(req.variables.contains_key("{{USER_LOCATION}}"));
        assert!(req.variables.contains_key("{{CURRENT_DATETIME}}"));
        assert_eq!(req.model_item.owned_by, "openai");
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn test_build_upstream_request_default_model_mcp_shape() {
        // Non-search models still send a one-element mcp_servers list, with
        // an empty id, so the wire payload matches the frontend's.
        let chat_req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"GLM-4.5","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        let cfg = Config::from_env();
        let features = resolve_model_features(&chat_req.model, &cfg);
        let req = build_upstream_request(&chat_req, features, "c".into(), "m".into());

        assert_eq!(req.mcp_servers, vec![String::new()]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mcp_servers"], serde_json::json!([""]));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer sk-123".parse().unwrap(),
        );
        assert_eq!(bearer_from_headers(&headers), Some("sk-123".to_string()));

        let empty = HeaderMap::new();
        assert_eq!(bearer_from_headers(&empty), None);

        let mut no_scheme = HeaderMap::new();
        no_scheme.insert(header::AUTHORIZATION, "sk-123".parse().unwrap());
        assert_eq!(bearer_from_headers(&no_scheme), None);
    }

    #[tokio::test]
    async fn test_missing_auth_rejected_with_401() {
        let state = test_state(4);
        let counters = state.counters.clone();
        let response = handle_chat_completions(
            State(state),
            peer(),
            HeaderMap::new(),
            Ok(Bytes::from_static(b"{}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Unauthorized");
        assert_eq!(counters.error_count(), 1);
        assert_eq!(counters.total_requests(), 1);
        // Permit released on the error path.
        assert_eq!(counters.current_connections(), 0);
    }

    #[tokio::test]
    async fn test_wrong_bearer_rejected_with_401() {
        let state = test_state(4);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        let response = handle_chat_completions(
            State(state),
            peer(),
            headers,
            Ok(Bytes::from_static(b"{}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_json_rejected_with_400() {
        let state = test_state(4);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer test-key".parse().unwrap());
        let response = handle_chat_completions(
            State(state),
            peer(),
            headers,
            Ok(Bytes::from_static(b"{not json")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid JSON format");
    }

    #[tokio::test]
    async fn test_saturated_gate_returns_503() {
        let state = test_state(1);
        let counters = state.counters.clone();

        // Occupy the only slot.
        let _held = state.gate.try_acquire().unwrap();

        let response = handle_chat_completions(
            State(state),
            peer(),
            HeaderMap::new(),
            Ok(Bytes::from_static(b"{}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Server too busy, please try again later");
        // Rejected requests are not counted as served requests.
        assert_eq!(counters.total_requests(), 0);
        assert_eq!(counters.current_connections(), 1);
    }

    #[tokio::test]
    async fn test_list_models() {
        let state = test_state(4);
        let Json(list) = handle_list_models(State(state)).await;
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 3);
        let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["GLM-4.5", "GLM-4.5-Thinking", "GLM-4.5-Search"]);
        assert!(list.data.iter().all(|m| m.owned_by == "z.ai"));
        assert!(list.data.iter().all(|m| m.object == "model"));
    }

    #[tokio::test]
    async fn test_stream_accounting_records_when_stream_dropped_mid_flight() {
        let state = test_state(4);
        let counters = state.counters.clone();
        let accounting = StreamAccounting {
            cfg: state.cfg.clone(),
            counters: counters.clone(),
            request_id: "req_test".to_string(),
            started: Instant::now() - std::time::Duration::from_millis(50),
        };
        let mut s = Box::pin(async_stream::stream! {
            let _accounting = accounting;
            loop {
                yield Ok::<_, String>(Bytes::from_static(b"data: x\n\n"));
            }
        });

        // Take one frame, then drop the stream the way a disconnecting
        // client does: the generator is cancelled at its suspended yield.
        let first = s.next().await;
        assert!(first.is_some());
        assert_eq!(counters.total_response_ms(), 0);
        drop(s);
        assert!(counters.total_response_ms() >= 50);
    }

    #[tokio::test]
    async fn test_error_body_serialization() {
        let body = ErrorBody {
            error: "External API request failed".to_string(),
            details: Some("all 3 attempts failed".to_string()),
            retry_after: Some(60),
            performance_mode: Some("balanced"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["retry_after"], 60);
        assert_eq!(json["performance_mode"], "balanced");

        let simple = serde_json::to_value(ErrorBody::simple("Unauthorized")).unwrap();
        assert_eq!(simple, serde_json::json!({"error": "Unauthorized"}));
    }
}
