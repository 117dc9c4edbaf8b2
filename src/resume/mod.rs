//! Resume files in the agent's on-disk conversation format.
//!
//! The agent only resumes conversations it can find under
//! `<agent_home>/projects/<encoded cwd>/<id>.jsonl`. [`ResumeWriter`] turns a
//! message history into such a file under a fresh id, so the same path serves
//! transcript import and recovery from a lost upstream conversation.
//!
//! ```text
//! <agent_home>/
//! └── projects/
//!     └── {encoded-working-dir}/
//!         ├── {resume-id}.jsonl
//!         └── sessions-index.json
//! ```

mod entries;
mod index;

use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::session::{SessionError, SessionResult};
use crate::store::write_atomic_sync;
use crate::types::{Message, Role};
use entries::{EntryContext, build_entries};
use index::IndexEntry;

/// Directory name the agent uses for a working directory.
pub fn encode_project_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ResumeWriter {
    agent_home: PathBuf,
    sync: bool,
}

impl ResumeWriter {
    pub fn new(agent_home: impl Into<PathBuf>) -> Self {
        Self {
            agent_home: agent_home.into(),
            sync: false,
        }
    }

    /// fsync written files before the rename.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn agent_home(&self) -> &Path {
        &self.agent_home
    }

    pub fn project_dir(&self, working_dir: &Path) -> PathBuf {
        self.agent_home
            .join("projects")
            .join(encode_project_path(working_dir))
    }

    pub fn conversation_path(&self, working_dir: &Path, resume_id: &str) -> PathBuf {
        self.project_dir(working_dir)
            .join(format!("{}.jsonl", resume_id))
    }

    /// Write `messages` as a new conversation and return its resume id.
    ///
    /// The index update is best-effort: a failure there is logged and the
    /// conversation file is still usable.
    pub async fn write(
        &self,
        messages: &[Message],
        working_dir: &Path,
        git_branch: Option<&str>,
    ) -> SessionResult<String> {
        let writer = self.clone();
        let messages = messages.to_vec();
        let working_dir = working_dir.to_path_buf();
        let git_branch = git_branch.unwrap_or_default().to_string();

        tokio::task::spawn_blocking(move || {
            writer.write_sync(&messages, &working_dir, &git_branch)
        })
        .await
        .map_err(|e| SessionError::Storage {
            message: format!("Task join error: {}", e),
        })?
    }

    fn write_sync(
        &self,
        messages: &[Message],
        working_dir: &Path,
        git_branch: &str,
    ) -> SessionResult<String> {
        let resume_id = Uuid::new_v4().to_string();
        let project_dir = self.project_dir(working_dir);
        let path = project_dir.join(format!("{}.jsonl", resume_id));

        let ctx = EntryContext {
            session_id: &resume_id,
            cwd: working_dir,
            git_branch,
        };
        let mut bytes = Vec::new();
        for entry in build_entries(messages, &ctx) {
            serde_json::to_writer(&mut bytes, &entry)?;
            bytes.push(b'\n');
        }
        write_atomic_sync(&path, &bytes, self.sync)?;

        let now = Utc::now();
        let entry = IndexEntry {
            session_id: resume_id.clone(),
            full_path: path.clone(),
            file_mtime: now.timestamp_millis(),
            first_prompt: messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.text())
                .unwrap_or_default(),
            message_count: messages.len(),
            created: messages.first().map(|m| m.timestamp).unwrap_or(now),
            modified: now,
            git_branch: git_branch.to_string(),
            project_path: working_dir.to_path_buf(),
            is_sidechain: false,
        };
        if let Err(e) = index::upsert(&project_dir, &entry, self.sync) {
            tracing::warn!(
                resume_id = %resume_id,
                dir = %project_dir.display(),
                error = %e,
                "Failed to update sessions index"
            );
        }

        tracing::debug!(
            resume_id = %resume_id,
            path = %path.display(),
            messages = messages.len(),
            "Wrote resume file"
        );
        Ok(resume_id)
    }
}

/// Current branch of the repository containing `dir`, if any.
pub async fn detect_git_branch(dir: &Path) -> Option<String> {
    tokio::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
