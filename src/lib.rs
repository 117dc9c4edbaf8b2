//! # agent-engine
//!
//! Drives coding-agent subprocesses over the stream-json stdio protocol and
//! keeps a durable record of every conversation.
//!
//! Each [`Session`] owns at most one agent process, an append-only message
//! log and a set of live subscribers. The [`SessionManager`] loads sessions
//! at startup, persists their metadata and handles trash, export and import.
//! When the agent reports that a resumed conversation no longer exists, the
//! session rebuilds it from its own history and carries on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_engine::{EngineConfig, SessionEvent, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), agent_engine::Error> {
//!     let config = EngineConfig::builder().data_dir("./.engine").build()?;
//!     let manager = SessionManager::open(config).await?;
//!
//!     let session = manager.get_or_create_default("main", "./project").await?;
//!     let mut events = session.subscribe();
//!     session.send("Summarize the README").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if matches!(event, SessionEvent::TurnComplete) {
//!             break;
//!         }
//!     }
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod annotate;
pub mod config;
pub mod manager;
pub mod observability;
pub mod protocol;
pub mod resume;
pub mod session;
pub mod store;
pub mod types;

pub use annotate::{DiffAnnotator, NoopAnnotator};
pub use config::{ConfigError, EngineConfig, SyncMode};
pub use manager::{ExportLevel, SessionManager, SessionManagerBuilder, Transcript};
pub use observability::{EngineMetrics, LoggingConfig, MetricsSnapshot};
pub use protocol::{AgentEvent, PermissionDecision};
pub use resume::ResumeWriter;
pub use session::{
    AgentProcess, AgentSpawner, CommandSpawner, LaunchSpec, Session, SessionError, SessionEvent,
    SessionId, SessionInfo, SessionResult, SessionStatus, Subscription,
};
pub use store::{JsonRecordStore, MemoryRecordStore, RecordStore, SessionRecord};
pub use types::{ContentBlock, Message, Role, TokenUsage, TranscriptStats};

/// Crate-level error covering every subsystem.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] observability::LoggingError),
}

/// Coarse classification for callers that only need to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The session is generating; retry after the turn completes.
    Busy,
    NotFound,
    /// The request itself was rejected (bad name, bad transcript, wrong state).
    Validation,
    Io,
    Internal,
    Configuration,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Session(err) => match err {
                SessionError::Busy { .. } => ErrorCategory::Busy,
                SessionError::NotFound { .. } => ErrorCategory::NotFound,
                SessionError::Trashed { .. }
                | SessionError::Cancelled { .. }
                | SessionError::NotRunning { .. }
                | SessionError::NoPendingPermission { .. }
                | SessionError::Validation { .. }
                | SessionError::InvalidTranscript { .. } => ErrorCategory::Validation,
                SessionError::Io(_) | SessionError::Storage { .. } | SessionError::Spawn { .. } => {
                    ErrorCategory::Io
                }
                SessionError::Serialization(_) => ErrorCategory::Internal,
            },
            Error::Config(_) | Error::Logging(_) => ErrorCategory::Configuration,
        }
    }

    /// Busy, not-found and validation failures: the caller can fix or retry them.
    pub fn is_caller_actionable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Busy | ErrorCategory::NotFound | ErrorCategory::Validation
        )
    }

    pub fn is_busy(&self) -> bool {
        self.category() == ErrorCategory::Busy
    }
}

pub type Result<T> = std::result::Result<T, Error>;
