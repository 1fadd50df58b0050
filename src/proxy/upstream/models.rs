// Upstream wire types - the Z.ai chat dialect
//
// Request shape is what the web frontend posts to /api/chat/completions;
// events are the parsed bodies of its SSE `data:` lines. Unknown fields on
// inbound events are ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::proxy::mappers::openai::models::ChatMessage;

// ============================================================================
// Outbound request
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: HashMap<String, serde_json::Value>,
    pub features: Features,
    pub background_tasks: BackgroundTasks,
    pub chat_id: String,
    pub id: String,
    /// Always one element on the wire: the search server id, or an empty
    /// string when search is not engaged.
    pub mcp_servers: Vec<String>,
    pub model_item: ModelItem,
    pub tool_servers: Vec<String>,
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub enable_thinking: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self {
            title_generation: false,
            tags_generation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

// ============================================================================
// Inbound events
// ============================================================================

/// One parsed upstream SSE event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub data: UpstreamEventData,
    #[serde(default)]
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEventData {
    #[serde(default)]
    pub delta_content: String,
    #[serde(default)]
    pub edit_content: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub done: bool,
    /// Variant dialect: reasoning arrives as its own delta field instead of
    /// a `thinking` phase.
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub error: Option<UpstreamError>,
    /// Some upstream builds nest errors one level deeper.
    #[serde(rename = "data", default)]
    pub inner: Option<UpstreamInner>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamInner {
    #[serde(default)]
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamError {
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub code: i64,
}

impl UpstreamEvent {
    /// True when the event carries an error at any of the three positions.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
            || self.data.error.is_some()
            || self
                .data
                .inner
                .as_ref()
                .map(|i| i.error.is_some())
                .unwrap_or(false)
    }

    /// True when the event signals end of stream.
    pub fn is_done(&self) -> bool {
        self.data.done || self.data.phase == "done"
    }
}
