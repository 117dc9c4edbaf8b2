//! Conversation entries in the agent's own JSONL format.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{ContentBlock, Message, Role};

/// Fields shared by every user/assistant line.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EntryCommon<'a> {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub session_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub cwd: &'a Path,
    pub version: &'static str,
    pub git_branch: &'a str,
    pub is_sidechain: bool,
    pub user_type: &'static str,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum Entry<'a> {
    User {
        #[serde(flatten)]
        common: EntryCommon<'a>,
        message: serde_json::Value,
    },
    Assistant {
        #[serde(flatten)]
        common: EntryCommon<'a>,
        message: serde_json::Value,
    },
}

/// Shared context for one conversation file.
pub(super) struct EntryContext<'a> {
    pub session_id: &'a str,
    pub cwd: &'a Path,
    pub git_branch: &'a str,
}

/// Split a message into role-homogeneous chunks. The agent expects tool
/// results on user lines, so results accumulated into an assistant turn are
/// moved out into their own user entries, keeping order.
fn split_by_role(message: &Message) -> Vec<(Role, Vec<ContentBlock>)> {
    let mut chunks: Vec<(Role, Vec<ContentBlock>)> = Vec::new();
    for block in &message.content {
        let role = match (message.role, block) {
            (_, ContentBlock::ToolResult(_)) => Role::User,
            (role, _) => role,
        };
        let block = block.without_annotation();
        match chunks.last_mut() {
            Some((last, blocks)) if *last == role => blocks.push(block),
            _ => chunks.push((role, vec![block])),
        }
    }
    chunks
}

/// Build the linked entry chain for a message history.
pub(super) fn build_entries<'a>(messages: &[Message], ctx: &EntryContext<'a>) -> Vec<Entry<'a>> {
    let mut entries = Vec::new();
    let mut parent: Option<String> = None;

    for message in messages {
        for (role, blocks) in split_by_role(message) {
            let uuid = Uuid::new_v4().to_string();
            let common = EntryCommon {
                uuid: uuid.clone(),
                parent_uuid: parent.replace(uuid),
                session_id: ctx.session_id,
                timestamp: message.timestamp,
                cwd: ctx.cwd,
                version: env!("CARGO_PKG_VERSION"),
                git_branch: ctx.git_branch,
                is_sidechain: false,
                user_type: "external",
            };
            let entry = match role {
                Role::User => Entry::User {
                    common,
                    message: serde_json::json!({
                        "role": "user",
                        "content": blocks,
                    }),
                },
                Role::Assistant => Entry::Assistant {
                    common,
                    message: serde_json::json!({
                        "id": format!("msg_{}", Uuid::new_v4().simple()),
                        "type": "message",
                        "role": "assistant",
                        "model": "imported",
                        "content": blocks,
                        "stop_reason": "end_turn",
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    }),
                },
            };
            entries.push(entry);
        }
    }
    entries
}
