// Shared helpers - id minting, key masking, client IP, pacing jitter

use axum::http::HeaderMap;
use rand::Rng;

use crate::models::config::USER_AGENT_POOL;

/// Mint a request id: `req_` + 8 random bytes in hex.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("req_{}", hex)
}

/// Mint a chat id in the upstream's `{nanos}-{secs}` shape.
pub fn generate_chat_id() -> String {
    let now = chrono::Utc::now();
    format!(
        "{}-{}",
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()),
        now.timestamp()
    )
}

/// Mint a message id (nanosecond timestamp).
pub fn generate_message_id() -> String {
    let now = chrono::Utc::now();
    format!("{}", now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()))
}

/// Mask an API key for log output: first 4 + stars + last 4, or all stars
/// when the key is too short to reveal anything.
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        return "*".repeat(key.len());
    }
    format!(
        "{}{}{}",
        &key[..4],
        "*".repeat(key.len() - 8),
        &key[key.len() - 4..]
    )
}

/// Extract the client IP: first `X-Forwarded-For` element, then `X-Real-IP`,
/// then the transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.to_string();
        }
    }
    peer.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Pick a User-Agent uniformly from the fixed pool.
pub fn random_user_agent() -> &'static str {
    let idx = rand::thread_rng().gen_range(0..USER_AGENT_POOL.len());
    USER_AGENT_POOL[idx]
}

/// Uniform random pacing delay in `[min_ms, max_ms)`; zero when the window
/// is empty or inverted.
pub fn random_pacing_delay(min_ms: u64, max_ms: u64) -> std::time::Duration {
    if max_ms <= min_ms {
        return std::time::Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(min_ms..max_ms);
    std::time::Duration::from_millis(ms)
}
