//! Events emitted by the agent on stdout.
//!
//! Every line is decoded in two steps: the `type` discriminator is read from
//! a generic JSON value, then the payload for that kind is deserialized into
//! its own struct. The raw value is kept alongside so it can be republished
//! verbatim.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{ContentBlock, TokenUsage};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event has no \"type\" field")]
    MissingType,

    #[error("malformed {kind} event: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One decoded stdout line.
#[derive(Debug, Clone)]
pub struct DecodedLine {
    pub raw: Arc<serde_json::Value>,
    pub event: AgentEvent,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
    ControlRequest(ControlRequestEvent),
    Stream(StreamEnvelope),
    /// Event kinds the engine does not interpret; still republished.
    Unknown { kind: String },
}

impl AgentEvent {
    pub fn kind(&self) -> &str {
        match self {
            AgentEvent::System(_) => "system",
            AgentEvent::Assistant(_) => "assistant",
            AgentEvent::User(_) => "user",
            AgentEvent::Result(_) => "result",
            AgentEvent::ControlRequest(_) => "control_request",
            AgentEvent::Stream(_) => "stream_event",
            AgentEvent::Unknown { kind } => kind,
        }
    }

    /// Upstream conversation id carried by the event, if any.
    pub fn session_id(&self) -> Option<&str> {
        let id = match self {
            AgentEvent::System(e) => e.session_id.as_deref(),
            AgentEvent::Assistant(e) => e.session_id.as_deref(),
            AgentEvent::User(e) => e.session_id.as_deref(),
            AgentEvent::Result(e) => e.session_id.as_deref(),
            AgentEvent::Stream(e) => e.session_id.as_deref(),
            AgentEvent::ControlRequest(_) | AgentEvent::Unknown { .. } => None,
        };
        id.filter(|s| !s.is_empty())
    }

    pub fn is_error_result(&self) -> bool {
        matches!(self, AgentEvent::Result(r) if r.is_error)
    }
}

pub fn decode_line(line: &str) -> Result<DecodedLine, DecodeError> {
    let raw: serde_json::Value = serde_json::from_str(line)?;
    let kind = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "system" => AgentEvent::System(payload(&raw, &kind)?),
        "assistant" => AgentEvent::Assistant(payload(&raw, &kind)?),
        "user" => AgentEvent::User(payload(&raw, &kind)?),
        "result" => AgentEvent::Result(payload(&raw, &kind)?),
        "control_request" => AgentEvent::ControlRequest(payload(&raw, &kind)?),
        "stream_event" => AgentEvent::Stream(payload(&raw, &kind)?),
        _ => AgentEvent::Unknown { kind },
    };

    Ok(DecodedLine {
        raw: Arc::new(raw),
        event,
    })
}

fn payload<T: serde::de::DeserializeOwned>(
    raw: &serde_json::Value,
    kind: &str,
) -> Result<T, DecodeError> {
    T::deserialize(raw).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub skills: Vec<serde_json::Value>,
}

impl SystemEvent {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }

    /// Slash commands followed by skill names, deduplicated in order.
    pub fn commands(&self) -> Vec<String> {
        let skills = self.skills.iter().filter_map(|skill| match skill {
            serde_json::Value::String(name) => Some(name.clone()),
            other => other
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string),
        });

        let mut out: Vec<String> = Vec::new();
        for name in self.slash_commands.iter().cloned().chain(skills) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantPayload,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantPayload {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl AssistantEvent {
    /// Content blocks the engine models; thinking and other kinds are skipped.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        decode_blocks(&self.message.content)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: UserPayload,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    #[serde(default)]
    pub content: serde_json::Value,
}

impl UserEvent {
    /// Tool results echoed back by the agent after running a tool.
    pub fn tool_results(&self) -> Vec<ContentBlock> {
        match &self.message.content {
            serde_json::Value::Array(items) => decode_blocks(items)
                .into_iter()
                .filter(|b| matches!(b, ContentBlock::ToolResult(_)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ResultEvent {
    /// Every human-readable error string the agent reported.
    pub fn error_texts(&self) -> Vec<&str> {
        let errors = self.errors.iter().filter_map(|e| match e {
            serde_json::Value::String(s) => Some(s.as_str()),
            other => other.get("message").and_then(|m| m.as_str()),
        });
        self.result.as_deref().into_iter().chain(errors).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestEvent {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub request: serde_json::Value,
}

impl ControlRequestEvent {
    pub fn subtype(&self) -> Option<&str> {
        self.request.get("subtype").and_then(|v| v.as_str())
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.request.get("tool_name").and_then(|v| v.as_str())
    }

    /// A `can_use_tool` request, answered with a [`PermissionDecision`].
    ///
    /// [`PermissionDecision`]: crate::protocol::PermissionDecision
    pub fn is_permission_request(&self) -> bool {
        self.subtype() == Some("can_use_tool")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    pub event: StreamEvent,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Token-level events nested inside `stream_event`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStartData,
    },
    ContentBlockStart {
        #[serde(default)]
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStartData {
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

fn decode_blocks(values: &[serde_json::Value]) -> Vec<ContentBlock> {
    values
        .iter()
        .filter_map(|v| ContentBlock::deserialize(v).ok())
        .collect()
}
