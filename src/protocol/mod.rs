//! The agent's newline-delimited stream-json protocol.
//!
//! Output from the agent is decoded by [`decode_line`]; input payloads are
//! built with [`UserTurn`] and [`PermissionDecision`].

mod events;
mod input;

use std::sync::LazyLock;

use regex::Regex;

pub use events::{
    AgentEvent, AssistantEvent, AssistantPayload, BlockStart, ContentDelta, ControlRequestEvent,
    DecodeError, DecodedLine, MessageStartData, ResultEvent, StreamEnvelope, StreamEvent,
    SystemEvent, UserEvent, UserPayload, decode_line,
};
pub use input::{PermissionDecision, UserTurn};

static CONVERSATION_LOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no conversation found|conversation (?:\S+ )?not found|session (?:id )?(?:\S+ )?not found")
        .expect("conversation-lost pattern is valid")
});

/// Whether an error text means the agent no longer has the resumed conversation.
pub fn is_conversation_lost(text: &str) -> bool {
    CONVERSATION_LOST.is_match(text)
}

/// A `result` event reporting that the resumed conversation is gone.
pub fn signals_conversation_lost(result: &ResultEvent) -> bool {
    result.is_error
        && result
            .error_texts()
            .into_iter()
            .any(is_conversation_lost)
}
