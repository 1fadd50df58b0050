// Streaming translator - upstream phase deltas to OpenAI SSE chunks
//
// The per-request state machine at the heart of the gateway. Consumes the
// upstream SSE body, routes thinking/answer phases into reasoning_content and
// content deltas, splices the first-answer edit block, and guarantees
// well-formed termination: the role opener is always first, at most one
// finish chunk is emitted, and `data: [DONE]` is always last, exactly once,
// under upstream errors, EOF, deadline expiry, and client disconnect alike.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tracing::debug;
use uuid::Uuid;

use crate::models::config::ThinkTagsMode;
use crate::proxy::mappers::sse::{data_payload, LineBuffer};
use crate::proxy::mappers::thinking::transform_thinking;
use crate::proxy::upstream::models::UpstreamEvent;

use super::models::{ChatCompletionChunk, ChunkChoice, Delta};

const DONE_FRAME: &str = "data: [DONE]\n\n";

// ============================================================================
// StreamOptions
// ============================================================================

pub struct StreamOptions {
    /// Model name echoed on every chunk (the name the client asked for).
    pub model: String,
    pub think_tags_mode: ThinkTagsMode,
    /// End-to-end deadline for the whole stream, from request start.
    pub deadline: tokio::time::Instant,
    /// Emit a zero-byte liveness probe every N received chunks; `None`
    /// disables probing.
    pub connection_check_interval: Option<u64>,
}

// ============================================================================
// Translator state machine
// ============================================================================

/// States: opener pending -> streaming -> closed. `closed` is absorbing;
/// lines arriving after it are discarded silently.
pub(crate) struct Translator {
    id: String,
    created: i64,
    model: String,
    mode: ThinkTagsMode,
    sent_initial_answer: bool,
    in_think_block: bool,
    buffered_think: String,
    closed: bool,
}

impl Translator {
    pub(crate) fn new(model: String, mode: ThinkTagsMode) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model,
            mode,
            sent_initial_answer: false,
            in_think_block: false,
            buffered_think: String::new(),
            closed: false,
        }
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed
    }

    fn frame(&self, delta: Delta, finish_reason: Option<&str>) -> Bytes {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(|s| s.to_string()),
            }],
        };
        let json = serde_json::to_string(&chunk).unwrap_or_default();
        Bytes::from(format!("data: {}\n\n", json))
    }

    /// The mandatory first frame: role only, no content.
    pub(crate) fn opener_frame(&self) -> Bytes {
        self.frame(Delta::role_opener(), None)
    }

    /// Flush accumulated variant-dialect thinking as one wrapped content
    /// chunk. Must run before the first non-thinking emission and before any
    /// terminal frame.
    fn flush_buffered_think(&mut self, out: &mut Vec<Bytes>) {
        if self.in_think_block && !self.buffered_think.is_empty() {
            let wrapped = format!("<think>{}</think>", self.buffered_think);
            out.push(self.frame(Delta::content(wrapped), None));
        }
        self.in_think_block = false;
        self.buffered_think.clear();
    }

    /// Terminal flush: buffered thinking, then the `[DONE]` sentinel.
    /// Used for upstream `[DONE]`, EOF, deadline expiry and disconnect.
    pub(crate) fn finish(&mut self, out: &mut Vec<Bytes>) {
        if self.closed {
            return;
        }
        self.flush_buffered_think(out);
        out.push(Bytes::from_static(DONE_FRAME.as_bytes()));
        self.closed = true;
    }

    /// Finish chunk (`finish_reason: "stop"`) followed by `[DONE]`.
    /// Used for the done signal and the error short-circuit.
    fn finish_with_stop(&mut self, out: &mut Vec<Bytes>) {
        if self.closed {
            return;
        }
        self.flush_buffered_think(out);
        out.push(self.frame(Delta::default(), Some("stop")));
        out.push(Bytes::from_static(DONE_FRAME.as_bytes()));
        self.closed = true;
    }

    /// Process one reassembled upstream line, appending output frames.
    pub(crate) fn process_line(&mut self, line: &str, out: &mut Vec<Bytes>) {
        if self.closed {
            return;
        }
        let Some(payload) = data_payload(line) else {
            return;
        };
        if payload == "[DONE]" {
            self.finish(out);
            return;
        }
        if payload.is_empty() {
            return;
        }

        let event: UpstreamEvent = match serde_json::from_str(payload) {
            Ok(ev) => ev,
            Err(e) => {
                // A single bad line never aborts the stream.
                debug!("skipping unparseable upstream line: {}", e);
                return;
            }
        };

        if event.has_error() {
            debug!("upstream reported an error event, terminating stream");
            self.finish_with_stop(out);
            return;
        }

        // First-answer splice: content inlined after the closing </details>
        // of the first answer-phase edit block. Fires at most once.
        if !self.sent_initial_answer
            && event.data.phase == "answer"
            && !event.data.edit_content.is_empty()
        {
            let parts: Vec<&str> = event.data.edit_content.split("</details>").collect();
            if parts.len() > 1 && !parts[1].is_empty() {
                self.flush_buffered_think(out);
                out.push(self.frame(Delta::content(parts[1]), None));
                self.sent_initial_answer = true;
            }
        }

        // Variant dialect: reasoning arrives as its own delta field and is
        // buffered until the terminal flush.
        if !event.data.reasoning_content.is_empty() {
            self.in_think_block = true;
            self.buffered_think.push_str(&event.data.reasoning_content);
        }

        if !event.data.delta_content.is_empty() {
            if event.data.phase == "thinking" {
                let transformed = transform_thinking(&event.data.delta_content, self.mode);
                if !transformed.is_empty() {
                    out.push(self.frame(Delta::reasoning(transformed), None));
                }
            } else {
                self.flush_buffered_think(out);
                out.push(self.frame(Delta::content(event.data.delta_content.clone()), None));
            }
        }

        if event.is_done() {
            self.finish_with_stop(out);
        }
    }
}

// ============================================================================
// Stream construction
// ============================================================================

/// Translate an upstream SSE byte stream into an OpenAI-chunk SSE stream.
///
/// The returned stream always yields the role opener first and ends with a
/// single `data: [DONE]\n\n` frame, whatever the upstream does. Deadline
/// expiry and upstream read errors are folded into the EOF path; a client
/// that disconnects drops the stream, which cancels the generator at its
/// next yield point.
pub fn create_sse_stream<S, E>(
    upstream: S,
    opts: StreamOptions,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut translator = Translator::new(opts.model, opts.think_tags_mode);
        let mut lines = LineBuffer::new();
        let mut check_counter: u64 = 0;

        yield Ok(translator.opener_frame());

        loop {
            let item = match tokio::time::timeout_at(opts.deadline, upstream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    debug!("stream deadline reached, flushing");
                    break;
                }
            };

            let chunk = match item {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    debug!("upstream body read failed: {}", e);
                    break;
                }
                None => break,
            };

            if let Some(interval) = opts.connection_check_interval {
                check_counter += 1;
                if interval > 0 && check_counter % interval == 0 {
                    // Liveness probe: harmless on a live connection, and a
                    // dropped client cancels the generator right here.
                    yield Ok(Bytes::new());
                }
            }

            let mut out = Vec::new();
            for line in lines.push(&chunk) {
                translator.process_line(&line, &mut out);
            }
            for frame in out {
                yield Ok(frame);
            }
            if translator.closed() {
                break;
            }
        }

        // EOF / deadline: process any unterminated final line, then run the
        // terminal flush so the client always sees [DONE].
        if !translator.closed() {
            let mut out = Vec::new();
            if let Some(rest) = lines.take_remainder() {
                translator.process_line(&rest, &mut out);
            }
            translator.finish(&mut out);
            for frame in out {
                yield Ok(frame);
            }
        }
    };
    Box::pin(stream)
}

// ============================================================================
// Tests
// ============================================================================
