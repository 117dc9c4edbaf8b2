//! One agent conversation: its subprocess, history and live viewers.

mod accumulator;
mod event;
mod ids;
mod process;
mod reader;
mod runtime;
mod subscribers;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::TokenUsage;

pub use event::SessionEvent;
pub use ids::SessionId;
pub use process::{AgentProcess, AgentSpawner, AgentStdin, AgentStdout, CommandSpawner, LaunchSpec};
pub use runtime::Session;
pub(crate) use runtime::SessionContext;
pub use subscribers::{SubscriberId, Subscription};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Session {id} is still generating a response")]
    Busy { id: String },

    #[error("Session {id} is in the trash")]
    Trashed { id: String },

    #[error("Turn for session {id} was cancelled before it reached the agent")]
    Cancelled { id: String },

    #[error("No agent process is running for session {id}")]
    NotRunning { id: String },

    #[error("Session {id} has no pending permission request")]
    NoPendingPermission { id: String },

    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Failed to start agent: {message}")]
    Spawn { message: String },

    #[error("Invalid transcript: {message}")]
    InvalidTranscript { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Runtime state of a session's agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Ready,
    Generating,
    WaitingForPermission,
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        !matches!(self, SessionStatus::Idle)
    }
}

/// Point-in-time view of a session for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub worktree: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}
