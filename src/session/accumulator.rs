//! Rebuilds a turn's content blocks from streamed and batch events.

use crate::protocol::{BlockStart, ContentDelta};
use crate::types::{ContentBlock, ToolUseBlock};

#[derive(Debug, Clone)]
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
    /// Block kinds that are not kept (thinking, server tools).
    Skipped,
}

/// Blocks of the in-progress assistant turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct TurnAccumulator {
    blocks: Vec<ContentBlock>,
    pending: Option<PendingBlock>,
    streamed: bool,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether token-level events were seen during this turn.
    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.pending.is_none()
    }

    pub fn start_block(&mut self, start: BlockStart) {
        self.streamed = true;
        if let Some(unfinished) = self.finish_block() {
            tracing::debug!("Block started before previous one stopped, keeping it unannotated");
            self.blocks.push(unfinished);
        }
        self.pending = Some(match start {
            BlockStart::Text { text } => PendingBlock::Text(text),
            BlockStart::ToolUse { id, name } => PendingBlock::ToolUse {
                id,
                name,
                partial_json: String::new(),
            },
            BlockStart::Other => PendingBlock::Skipped,
        });
    }

    pub fn push_delta(&mut self, delta: ContentDelta) {
        let Some(pending) = self.pending.as_mut() else {
            // A text delta without a start opens an implicit block.
            if let ContentDelta::TextDelta { text } = delta {
                self.streamed = true;
                self.pending = Some(PendingBlock::Text(text));
            }
            return;
        };
        match (pending, delta) {
            (PendingBlock::Text(buf), ContentDelta::TextDelta { text }) => buf.push_str(&text),
            (
                PendingBlock::ToolUse { partial_json, .. },
                ContentDelta::InputJsonDelta { partial_json: json },
            ) => partial_json.push_str(&json),
            _ => {}
        }
    }

    /// Finalize the open block. The caller decides whether to enrich it
    /// before handing it back through [`push`](Self::push).
    pub fn finish_block(&mut self) -> Option<ContentBlock> {
        match self.pending.take()? {
            PendingBlock::Text(text) if !text.is_empty() => Some(ContentBlock::Text { text }),
            PendingBlock::Text(_) | PendingBlock::Skipped => None,
            PendingBlock::ToolUse {
                id,
                name,
                partial_json,
            } => {
                let input = if partial_json.trim().is_empty() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    match serde_json::from_str(&partial_json) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(
                                tool_name = %name,
                                tool_id = %id,
                                partial_json_len = partial_json.len(),
                                error = %e,
                                "Failed to parse streamed tool input, using empty object"
                            );
                            serde_json::Value::Object(serde_json::Map::new())
                        }
                    }
                };
                Some(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)))
            }
        }
    }

    pub fn push(&mut self, block: ContentBlock) {
        self.blocks.push(block);
    }

    /// Drain every block, including one left open by an interrupted stream.
    /// The streamed flag survives until [`clear`](Self::clear) ends the turn.
    pub fn take(&mut self) -> Vec<ContentBlock> {
        if let Some(block) = self.finish_block() {
            self.blocks.push(block);
        }
        std::mem::take(&mut self.blocks)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
