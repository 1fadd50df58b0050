// Structured per-request telemetry
//
// One JSON record per request and per response, matching the operational log
// schema consumed downstream. Records are emitted as single lines through the
// `telemetry` tracing target; verbosity flags decide whether message bodies
// travel with them.

use serde::Serialize;
use serde_json::Value;

use crate::models::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp: String,
    pub level: LogLevel,
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub client_ip: String,
    pub api_key: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResponseRecord {
    pub request_id: String,
    pub timestamp: String,
    pub level: LogLevel,
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub endpoint: String,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn level_for_status(status: u16) -> LogLevel {
    if status >= 400 {
        LogLevel::Error
    } else if status >= 300 {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

fn emit<T: Serialize>(record: &T) {
    match serde_json::to_string(record) {
        Ok(line) => tracing::info!(target: "telemetry", "{}", line),
        Err(e) => tracing::warn!("telemetry serialization failed: {}", e),
    }
}

/// Emit the request-side record. Message bodies are included only when
/// `log_user_messages` is set.
#[allow(clippy::too_many_arguments)]
pub fn log_request(
    cfg: &Config,
    request_id: &str,
    client_ip: &str,
    masked_key: &str,
    model: &str,
    message_count: usize,
    parameters: Value,
    messages: Option<Value>,
    user_agent: Option<&str>,
) {
    if !cfg.enable_detailed_logging {
        return;
    }
    let record = RequestRecord {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: LogLevel::Info,
        record_type: "request",
        client_ip: client_ip.to_string(),
        api_key: masked_key.to_string(),
        model: model.to_string(),
        messages: if cfg.log_user_messages { messages } else { None },
        parameters: Some(serde_json::json!({
            "message_count": message_count,
            "parameters": parameters,
        })),
        user_agent: user_agent.map(|s| s.to_string()),
    };
    emit(&record);
}

/// Emit the response-side record with the final status and timing.
pub fn log_response(
    cfg: &Config,
    request_id: &str,
    status_code: u16,
    response_time_ms: u64,
    endpoint: &str,
    retry_count: u32,
    error: &str,
) {
    if !cfg.enable_detailed_logging {
        return;
    }
    let record = ResponseRecord {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: level_for_status(status_code),
        record_type: "response",
        status_code,
        response_time_ms,
        endpoint: endpoint.to_string(),
        retry_count,
        content: None,
        error: error.to_string(),
    };
    emit(&record);
}
