//! Events delivered to session subscribers.

use std::sync::Arc;

/// What a subscriber receives, in emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An agent stdout event, republished verbatim.
    Agent(Arc<serde_json::Value>),
    /// An edit/write tool-use block gained a rendered diff.
    AnnotationReady {
        tool_use_id: String,
        annotation: String,
    },
    /// A `result` closed the turn and the assistant message was persisted.
    TurnComplete,
}

impl SessionEvent {
    pub fn kind(&self) -> &str {
        match self {
            SessionEvent::Agent(raw) => raw.get("type").and_then(|t| t.as_str()).unwrap_or(""),
            SessionEvent::AnnotationReady { .. } => "annotation_ready",
            SessionEvent::TurnComplete => "turn_complete",
        }
    }

    /// JSON form for transports that forward events as-is.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SessionEvent::Agent(raw) => raw.as_ref().clone(),
            SessionEvent::AnnotationReady {
                tool_use_id,
                annotation,
            } => serde_json::json!({
                "type": "annotation_ready",
                "tool_use_id": tool_use_id,
                "annotation": annotation,
            }),
            SessionEvent::TurnComplete => serde_json::json!({"type": "turn_complete"}),
        }
    }
}
