// Anonymous-token bootstrap
//
// Each conversation fetches a fresh guest token from the upstream auth
// endpoint so successive requests cannot be linked to each other. Any
// failure falls back silently to the statically configured token; the
// client never sees the difference.

use std::time::Duration;

use reqwest::{header, Client};
use tracing::debug;

use crate::models::config::{
    Config, BROWSER_UA, ORIGIN_BASE, SEC_CH_UA, SEC_CH_UA_MOBILE, SEC_CH_UA_PLATFORM,
    X_FE_VERSION,
};

const AUTH_PATH: &str = "/api/v1/auths/";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Extract the token field from the auth endpoint's JSON body. Empty or
/// missing tokens are treated as absent.
fn parse_token_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let token = value.get("token")?.as_str()?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Fetch a fresh anonymous token. `None` on any failure; the caller falls
/// back to the configured upstream token.
pub async fn fetch_anonymous_token(http: &Client) -> Option<String> {
    let url = format!("{}{}", ORIGIN_BASE, AUTH_PATH);
    let result = http
        .get(&url)
        .timeout(FETCH_TIMEOUT)
        .header(header::USER_AGENT, BROWSER_UA)
        .header(header::ACCEPT, "*/*")
        .header(header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9")
        .header("X-FE-Version", X_FE_VERSION)
        .header("sec-ch-ua", SEC_CH_UA)
        .header("sec-ch-ua-mobile", SEC_CH_UA_MOBILE)
        .header("sec-ch-ua-platform", SEC_CH_UA_PLATFORM)
        .header(header::ORIGIN, ORIGIN_BASE)
        .header(header::REFERER, format!("{}/", ORIGIN_BASE))
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) => {
            debug!("anonymous token fetch failed: {}", e);
            return None;
        }
    };

    if !response.status().is_success() {
        debug!("anonymous token fetch status={}", response.status());
        return None;
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            debug!("anonymous token body read failed: {}", e);
            return None;
        }
    };

    match parse_token_body(&body) {
        Some(token) => Some(token),
        None => {
            debug!("anonymous token response missing token field");
            None
        }
    }
}

/// Pick the bearer for this request: a fresh anonymous token when enabled
/// and obtainable, otherwise the configured fallback.
pub async fn acquire_bearer(cfg: &Config, http: &Client) -> String {
    if cfg.anon_token_enabled {
        if let Some(token) = fetch_anonymous_token(http).await {
            let preview: String = token.chars().take(10).collect();
            debug!("anonymous token acquired: {}...", preview);
            return token;
        }
        debug!("falling back to configured upstream token");
    }
    cfg.upstream_token.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_body() {
        assert_eq!(
            parse_token_body(r#"{"token":"abc123"}"#),
            Some("abc123".to_string())
        );
        assert_eq!(parse_token_body(r#"{"token":""}"#), None);
        assert_eq!(parse_token_body(r#"{"other":"x"}"#), None);
        assert_eq!(parse_token_body("not json"), None);
        assert_eq!(parse_token_body(r#"{"token":42}"#), None);
    }

    #[tokio::test]
    async fn test_acquire_bearer_disabled_uses_fallback() {
        let mut cfg = Config::from_env();
        cfg.anon_token_enabled = false;
        cfg.upstream_token = "fallback-token".to_string();
        let http = Client::new();
        assert_eq!(acquire_bearer(&cfg, &http).await, "fallback-token");
    }
}
