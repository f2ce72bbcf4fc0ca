//! Event Streamer (C5): encodes artifact-creation and status events into a
//! line-oriented server-sent-event stream (SPEC_FULL.md §4.5/§6).

use serde::Serialize;

use crate::model::{ConversationId, NodeView};

/// One SSE payload. Serializes to the `{type: ...}` wire shape; the
/// producing code is responsible for framing each as `data: <json>\n\n`
/// (done by the HTTP layer, §10.1).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeliberationEvent {
    Start {
        conversation_id: ConversationId,
    },
    Status {
        message: String,
    },
    Node {
        node: NodeView,
    },
    Error {
        message: String,
    },
    Done,
}

impl DeliberationEvent {
    /// Render as a single SSE frame: `data: <json>\n\n`.
    pub fn to_sse_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}
