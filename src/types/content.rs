//! Content block types for conversation messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

/// A tool invocation requested by the agent.
///
/// `diff_annotation` is attached after the fact by a [`crate::annotate::DiffAnnotator`]
/// and is never sent back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(
        rename = "diffAnnotation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub diff_annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ToolResultContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Tool output is either a plain string or a list of typed blocks; the
/// block form is kept opaque since only the agent interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl From<&str> for ContentBlock {
    fn from(text: &str) -> Self {
        ContentBlock::text(text)
    }
}

impl From<String> for ContentBlock {
    fn from(text: String) -> Self {
        ContentBlock::Text { text }
    }
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolUse(ToolUseBlock::new(id, name, input))
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id: tool_use_id.into(),
            content: Some(ToolResultContent::Text(content.into())),
            is_error: None,
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            ContentBlock::ToolUse(tool_use) => Some(tool_use),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse(_))
    }

    /// Copy of this block in the shape the agent itself stores (no annotation).
    pub fn without_annotation(&self) -> Self {
        match self {
            ContentBlock::ToolUse(tool_use) if tool_use.diff_annotation.is_some() => {
                ContentBlock::ToolUse(ToolUseBlock {
                    diff_annotation: None,
                    ..tool_use.clone()
                })
            }
            other => other.clone(),
        }
    }

    /// Replace tool input/output with empty placeholders.
    pub fn redacted(&self) -> Self {
        match self {
            ContentBlock::ToolUse(tool_use) => ContentBlock::ToolUse(ToolUseBlock {
                id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                input: serde_json::Value::Object(serde_json::Map::new()),
                diff_annotation: None,
            }),
            ContentBlock::ToolResult(result) => ContentBlock::ToolResult(ToolResultBlock {
                tool_use_id: result.tool_use_id.clone(),
                content: None,
                is_error: result.is_error,
            }),
            text => text.clone(),
        }
    }
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            diff_annotation: None,
        }
    }

    /// File path targeted by an edit/write style tool, if present.
    pub fn file_path(&self) -> Option<&str> {
        self.input
            .get("file_path")
            .or_else(|| self.input.get("notebook_path"))
            .and_then(|v| v.as_str())
    }
}
