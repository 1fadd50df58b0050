// Upstream dispatcher
//
// Wraps a shared reqwest client and executes the chat request against the
// Z.ai endpoint with exponential backoff, randomized pacing, and a throttle
// path for 429/403. Every sleep and send is bounded by the caller's deadline;
// success means a live 200 response whose body is the upstream SSE stream.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use tokio::time::Instant;
use tracing::debug;

use crate::models::config::{
    Config, ORIGIN_BASE, SEC_CH_UA, SEC_CH_UA_MOBILE, SEC_CH_UA_PLATFORM, X_FE_VERSION,
};
use crate::proxy::common::{random_pacing_delay, random_user_agent};

use super::models::UpstreamRequest;

/// Hard cap on the 429/403 throttle wait.
const THROTTLE_CAP_MS: u64 = 10_000;

// ============================================================================
// DispatchError
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request deadline elapsed during a sleep or an in-flight attempt.
    DeadlineExceeded,
    /// All retry attempts were consumed; carries the last observed error.
    Exhausted { attempts: u32, last_error: String },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "request deadline exceeded"),
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "all {} attempts failed, last error: {}", attempts, last_error),
        }
    }
}

impl std::error::Error for DispatchError {}

// ============================================================================
// Backoff arithmetic
// ============================================================================

/// Exponential backoff before the i-th attempt (0-based); attempt 0 gets none.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(20)))
}

/// Throttle wait after a 429/403 on the i-th attempt, capped at 10s.
fn throttle_delay(base_ms: u64, attempt: u32) -> Duration {
    let ms = base_ms.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(ms.min(THROTTLE_CAP_MS))
}

/// Sleep for `dur` unless that would overrun the deadline, in which case the
/// dispatch is abandoned immediately.
async fn sleep_within(dur: Duration, deadline: Instant) -> Result<(), DispatchError> {
    if dur.is_zero() {
        return Ok(());
    }
    if Instant::now() + dur >= deadline {
        return Err(DispatchError::DeadlineExceeded);
    }
    tokio::time::sleep(dur).await;
    Ok(())
}

// ============================================================================
// UpstreamClient
// ============================================================================

pub struct UpstreamClient {
    http: Client,
    cfg: Arc<Config>,
}

impl UpstreamClient {
    pub fn new(cfg: Arc<Config>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("Failed to create upstream HTTP client");
        Self { http, cfg }
    }

    /// Shared HTTP client, also used by the anonymous-token bootstrap.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Browser-mimicking header set for one chat dispatch. The Referer
    /// carries the freshly minted chat id.
    fn chat_headers(&self, chat_id: &str, bearer: &str) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Ok(auth) = header::HeaderValue::from_str(&format!("Bearer {}", bearer)) {
            headers.insert(header::AUTHORIZATION, auth);
        }
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("zh-CN"),
        );
        headers.insert("sec-ch-ua", header::HeaderValue::from_static(SEC_CH_UA));
        headers.insert(
            "sec-ch-ua-mobile",
            header::HeaderValue::from_static(SEC_CH_UA_MOBILE),
        );
        headers.insert(
            "sec-ch-ua-platform",
            header::HeaderValue::from_static(SEC_CH_UA_PLATFORM),
        );
        headers.insert(
            "X-FE-Version",
            header::HeaderValue::from_static(X_FE_VERSION),
        );
        headers.insert(header::ORIGIN, header::HeaderValue::from_static(ORIGIN_BASE));
        if let Ok(referer) =
            header::HeaderValue::from_str(&format!("{}/c/{}", ORIGIN_BASE, chat_id))
        {
            headers.insert(header::REFERER, referer);
        }
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(random_user_agent()),
        );
        headers
    }

    /// Execute the upstream request with retry, backoff and pacing. Returns
    /// the live 200 response or the terminal error after all attempts.
    pub async fn dispatch(
        &self,
        request: &UpstreamRequest,
        chat_id: &str,
        bearer: &str,
        deadline: Instant,
    ) -> Result<Response, DispatchError> {
        let attempts = self.cfg.max_retries.max(1);
        let mut last_error = String::from("no attempt completed");

        for attempt in 0..attempts {
            sleep_within(backoff_delay(self.cfg.retry_delay_ms, attempt), deadline).await?;
            sleep_within(
                random_pacing_delay(self.cfg.random_delay_min_ms, self.cfg.random_delay_max_ms),
                deadline,
            )
            .await?;

            debug!(
                "dispatching upstream request (attempt {}/{})",
                attempt + 1,
                attempts
            );

            let send = self
                .http
                .post(&self.cfg.upstream_url)
                .headers(self.chat_headers(chat_id, bearer))
                .json(request)
                .send();

            let response = match tokio::time::timeout_at(deadline, send).await {
                Err(_) => return Err(DispatchError::DeadlineExceeded),
                Ok(Err(e)) => {
                    last_error = format!("transport error: {}", e);
                    debug!(
                        "attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        last_error
                    );
                    continue;
                }
                Ok(Ok(resp)) => resp,
            };

            let status = response.status();
            if status == StatusCode::OK {
                return Ok(response);
            }

            last_error = format!("HTTP {}", status.as_u16());

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                let wait = throttle_delay(self.cfg.retry_delay_ms, attempt);
                debug!(
                    "throttled by upstream ({}), waiting {:?} before retry",
                    status.as_u16(),
                    wait
                );
                drop(response);
                sleep_within(wait, deadline).await?;
                continue;
            }

            debug!(
                "attempt {}/{} failed: {}",
                attempt + 1,
                attempts,
                last_error
            );
            drop(response);
        }

        Err(DispatchError::Exhausted {
            attempts,
            last_error,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
