//! Payloads written to the agent's stdin.

use serde::Serialize;

use crate::types::ContentBlock;

/// A user turn in stream-json input format.
#[derive(Debug, Clone, Serialize)]
pub struct UserTurn {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserTurnMessage,
}

#[derive(Debug, Clone, Serialize)]
struct UserTurnMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

impl UserTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_content(vec![ContentBlock::text(text)])
    }

    pub fn with_content(content: Vec<ContentBlock>) -> Self {
        Self {
            kind: "user",
            message: UserTurnMessage {
                role: "user",
                content,
            },
        }
    }

    /// Serialized form terminated by a newline, ready for the pipe.
    pub fn to_line(&self) -> serde_json::Result<String> {
        to_line(self)
    }
}

/// Answer to a `can_use_tool` control request.
#[derive(Debug, Clone)]
pub enum PermissionDecision {
    Allow {
        updated_input: serde_json::Value,
    },
    Deny {
        message: String,
    },
}

impl PermissionDecision {
    pub fn allow(updated_input: serde_json::Value) -> Self {
        Self::Allow { updated_input }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }

    /// `control_response` line for the given request id.
    pub fn to_line(&self, request_id: &str) -> serde_json::Result<String> {
        let decision = match self {
            PermissionDecision::Allow { updated_input } => serde_json::json!({
                "behavior": "allow",
                "updatedInput": updated_input,
            }),
            PermissionDecision::Deny { message } => serde_json::json!({
                "behavior": "deny",
                "message": message,
            }),
        };
        to_line(&serde_json::json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": decision,
            }
        }))
    }
}

fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}
