//! Session metadata persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::atomic::write_atomic;
use crate::config::SyncMode;
use crate::session::{SessionError, SessionId, SessionResult};

/// Everything about a session except its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub worktree: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_trashed(&self) -> bool {
        self.trashed_at.is_some()
    }
}

/// Storage for the full set of session records, saved as one document.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> SessionResult<Vec<SessionRecord>>;

    async fn save(&self, records: &[SessionRecord]) -> SessionResult<()>;
}

/// A JSON array of records in a single file, rewritten atomically.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    path: PathBuf,
    sync_mode: SyncMode,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_mode: SyncMode::default(),
        }
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonRecordStore {
    fn name(&self) -> &str {
        "json"
    }

    async fn load(&self) -> SessionResult<Vec<SessionRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Storage {
                    message: format!("Failed to read {}: {}", self.path.display(), e),
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, records: &[SessionRecord]) -> SessionResult<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        write_atomic(self.path.clone(), bytes, self.sync_mode == SyncMode::OnWrite).await
    }
}

/// In-memory record store for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<Vec<SessionRecord>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<SessionRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            saves: Arc::default(),
        }
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        self.records.read().await.clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self) -> SessionResult<Vec<SessionRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn save(&self, records: &[SessionRecord]) -> SessionResult<()> {
        *self.records.write().await = records.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
