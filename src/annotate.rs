//! Diff annotations for file-editing tool calls.
//!
//! The renderer itself lives outside this crate. Sessions call it once per
//! completed edit/write tool-use block and attach whatever it returns.

use std::path::Path;

use crate::types::ToolUseBlock;

const FILE_EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Tools whose input describes a change to a file on disk.
pub fn is_file_edit_tool(name: &str) -> bool {
    FILE_EDIT_TOOLS.contains(&name)
}

/// Renders a tool-use block into an HTML diff.
///
/// Implementations never fail: unreadable, binary or oversized input yields
/// `None`. They may read files, so callers run them off async threads.
pub trait DiffAnnotator: Send + Sync {
    fn annotate(&self, block: &ToolUseBlock, working_dir: &Path) -> Option<String>;
}

/// Produces no annotations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnnotator;

impl DiffAnnotator for NoopAnnotator {
    fn annotate(&self, _block: &ToolUseBlock, _working_dir: &Path) -> Option<String> {
        None
    }
}

impl<F> DiffAnnotator for F
where
    F: Fn(&ToolUseBlock, &Path) -> Option<String> + Send + Sync,
{
    fn annotate(&self, block: &ToolUseBlock, working_dir: &Path) -> Option<String> {
        self(block, working_dir)
    }
}
