//! `sessions-index.json` maintenance.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionResult;
use crate::store::write_atomic_sync;

pub(super) const INDEX_FILE: &str = "sessions-index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct SessionsIndex {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IndexEntry {
    pub session_id: String,
    pub full_path: PathBuf,
    pub file_mtime: i64,
    pub first_prompt: String,
    pub message_count: usize,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub git_branch: String,
    pub project_path: PathBuf,
    pub is_sidechain: bool,
}

/// Insert or replace `entry` in the index next to the conversation file.
/// Entries this crate does not understand are preserved as-is.
pub(super) fn upsert(project_dir: &Path, entry: &IndexEntry, sync: bool) -> SessionResult<()> {
    let path = project_dir.join(INDEX_FILE);
    let mut index = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice::<SessionsIndex>(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionsIndex {
            version: 1,
            entries: Vec::new(),
        },
        Err(e) => return Err(e.into()),
    };

    index.entries.retain(|existing| {
        existing.get("sessionId").and_then(|v| v.as_str()) != Some(entry.session_id.as_str())
    });
    index.entries.push(serde_json::to_value(entry)?);

    let bytes = serde_json::to_vec_pretty(&index)?;
    write_atomic_sync(&path, &bytes, sync)
}
