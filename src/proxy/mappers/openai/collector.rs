// Non-streaming collector
//
// Drains the upstream SSE body into a single assistant message. Parsing is
// shared with the streaming translator (same line reassembly, same event
// shape); nothing is emitted until the stream ends or a done signal arrives.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::models::config::ThinkTagsMode;
use crate::proxy::mappers::sse::{data_payload, LineBuffer};
use crate::proxy::mappers::thinking::transform_thinking;
use crate::proxy::upstream::models::UpstreamEvent;

use super::models::{ChatCompletionResponse, ChatMessage, Choice, Usage};

/// Accumulate one upstream data line into `content`. Returns true when the
/// line carried a done signal.
fn collect_line(line: &str, mode: ThinkTagsMode, content: &mut String) -> bool {
    let Some(payload) = data_payload(line) else {
        return false;
    };
    if payload.is_empty() {
        return false;
    }
    if payload == "[DONE]" {
        return true;
    }

    let event: UpstreamEvent = match serde_json::from_str(payload) {
        Ok(ev) => ev,
        Err(e) => {
            debug!("skipping unparseable upstream line: {}", e);
            return false;
        }
    };

    if !event.data.delta_content.is_empty() {
        let out = if event.data.phase == "thinking" {
            transform_thinking(&event.data.delta_content, mode)
        } else {
            event.data.delta_content.clone()
        };
        if !out.is_empty() {
            content.push_str(&out);
        }
    }

    event.is_done()
}

/// Drain the upstream stream into the accumulated assistant content.
/// Deadline expiry and read errors end collection with whatever arrived.
pub async fn collect_content<S, E>(
    upstream: S,
    mode: ThinkTagsMode,
    deadline: tokio::time::Instant,
) -> String
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    let mut upstream = Box::pin(upstream);
    let mut lines = LineBuffer::new();
    let mut content = String::new();

    'outer: loop {
        let item = match tokio::time::timeout_at(deadline, upstream.next()).await {
            Ok(item) => item,
            Err(_) => {
                debug!("aggregation deadline reached");
                break;
            }
        };
        let chunk = match item {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                debug!("upstream body read failed during aggregation: {}", e);
                break;
            }
            None => break,
        };
        for line in lines.push(&chunk) {
            if collect_line(&line, mode, &mut content) {
                break 'outer;
            }
        }
    }

    if let Some(rest) = lines.take_remainder() {
        collect_line(&rest, mode, &mut content);
    }
    content
}

/// Build the final non-streaming response around the collected content.
pub fn build_response(model: &str, content: String) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage::default()),
    }
}
