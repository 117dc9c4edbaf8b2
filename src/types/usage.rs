//! Token usage counters and derived transcript statistics.

use serde::{Deserialize, Deserializer, Serialize};

use super::{Message, Role};

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Token usage as reported by the agent for the latest turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub output_tokens: u64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub cache_read_input_tokens: u64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Tokens occupying the context window (fresh input plus cache traffic).
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

/// Counts derived from a message list; always recomputed, never authoritative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptStats {
    pub message_count: usize,
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub tool_uses: usize,
}

impl TranscriptStats {
    pub fn from_messages(messages: &[Message]) -> Self {
        messages.iter().fold(Self::default(), |mut stats, msg| {
            stats.message_count += 1;
            match msg.role {
                Role::User => stats.user_turns += 1,
                Role::Assistant => stats.assistant_turns += 1,
            }
            stats.tool_uses += msg.tool_uses().count();
            stats
        })
    }
}
