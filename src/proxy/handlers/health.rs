// Health and status endpoints
//
// Read-only projections of the config snapshot and the runtime counters.
// Neither endpoint passes through the admission gate.

use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::models::config::{BUILD_DATE, DESCRIPTION, VERSION};
use crate::proxy::monitor::{system_status, StatusSnapshot};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthConfig {
    pub max_retries: u32,
    pub retry_delay: u64,
    pub request_timeout: u64,
    pub random_delay: String,
    pub max_concurrent_connections: usize,
    pub stream_buffer_size: usize,
    pub connection_check_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthStats {
    pub total_requests: u64,
    pub average_response_time: u64,
    pub error_rate: u64,
    pub current_connections: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub build_date: &'static str,
    pub description: &'static str,
    pub performance_mode: &'static str,
    pub uptime_seconds: u64,
    pub config: HealthConfig,
    pub stats: HealthStats,
    pub improvements: Vec<&'static str>,
}

/// GET /health
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cfg = &state.cfg;
    let counters = &state.counters;

    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: VERSION,
        build_date: BUILD_DATE,
        description: DESCRIPTION,
        performance_mode: cfg.performance_mode.as_str(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        config: HealthConfig {
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay_ms,
            request_timeout: cfg.request_timeout_ms,
            random_delay: format!(
                "{}-{}ms",
                cfg.random_delay_min_ms, cfg.random_delay_max_ms
            ),
            max_concurrent_connections: cfg.max_concurrent_connections,
            stream_buffer_size: cfg.stream_buffer_size,
            connection_check_enabled: !cfg.disable_connection_check,
        },
        stats: HealthStats {
            total_requests: counters.total_requests(),
            average_response_time: counters.average_response_ms(),
            error_rate: counters.error_rate_percent(),
            current_connections: counters.current_connections(),
        },
        improvements: vec![
            "Bounded admission control",
            "Structured request telemetry",
            "Performance-mode presets",
            "Retry with exponential backoff and jitter",
            "Per-request anonymous tokens",
            "Streaming phase translation",
            "Thinking-content rewriting",
            "Health and status monitoring",
        ],
    })
}

/// GET /status
pub async fn handle_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(system_status(&state.cfg, &state.counters, state.started_at))
}
