//! Session registry and lifecycle.
//!
//! The manager owns every [`Session`], persists their metadata through a
//! [`RecordStore`] and lays out message logs under the configured data
//! directory. The registry lock and a session's own locks are never held
//! together: operations copy out the `Arc<Session>` first.

mod transcript;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use transcript::{
    ExportLevel, SCHEMA_MONOLITHIC, SCHEMA_SPLIT, Transcript, TranscriptSource,
};

use crate::annotate::{DiffAnnotator, NoopAnnotator};
use crate::config::{EngineConfig, SyncMode};
use crate::observability::{EngineMetrics, MetricsSnapshot};
use crate::resume::{ResumeWriter, detect_git_branch};
use crate::session::{
    AgentSpawner, CommandSpawner, Session, SessionContext, SessionError, SessionId, SessionInfo,
    SessionResult,
};
use crate::store::{JsonRecordStore, MessageLog, RecordStore, SessionRecord, read_messages};
use crate::types::Message;

/// Bursts of persist requests inside this window collapse into one save.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(50);

const DEFAULT_NAME_PREFIX: &str = "Session ";

pub struct SessionManagerBuilder {
    config: EngineConfig,
    spawner: Option<Arc<dyn AgentSpawner>>,
    annotator: Option<Arc<dyn DiffAnnotator>>,
    record_store: Option<Arc<dyn RecordStore>>,
}

impl SessionManagerBuilder {
    /// Replace the subprocess launcher (defaults to the configured binary).
    pub fn spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn annotator(mut self, annotator: Arc<dyn DiffAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// Replace the metadata store (defaults to `sessions.json` in the data dir).
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Load every persisted session and start the background persister.
    pub async fn build(self) -> SessionResult<SessionManager> {
        let config = self.config;
        config.validate().map_err(|e| SessionError::Validation {
            message: e.to_string(),
        })?;
        tokio::fs::create_dir_all(config.messages_dir()).await?;

        let records = self.record_store.unwrap_or_else(|| {
            Arc::new(JsonRecordStore::new(config.records_path()).sync_mode(config.sync_mode))
        });
        let spawner = self.spawner.unwrap_or_else(|| {
            Arc::new(CommandSpawner::new(&config.agent_binary).args(config.agent_args.clone()))
        });
        let ctx = SessionContext {
            spawner,
            annotator: self.annotator.unwrap_or_else(|| Arc::new(NoopAnnotator)),
            resume: ResumeWriter::new(&config.agent_home)
                .sync(config.sync_mode == SyncMode::OnWrite),
            metrics: Arc::new(EngineMetrics::new()),
            persist: Arc::new(Notify::new()),
            subscriber_buffer: config.subscriber_buffer,
        };

        let inner = Arc::new(ManagerInner {
            config,
            records,
            ctx,
            registry: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });
        inner.load().await?;

        tokio::spawn(run_persister(
            Arc::downgrade(&inner),
            Arc::clone(&inner.ctx.persist),
            inner.shutdown.clone(),
        ));
        Ok(SessionManager { inner })
    }
}

struct ManagerInner {
    config: EngineConfig,
    records: Arc<dyn RecordStore>,
    ctx: SessionContext,
    registry: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Serializes saves so an older snapshot never lands after a newer one.
    persist_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All sessions, oldest first.
    fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.registry().values().cloned().collect();
        sessions.sort_by_key(|s| (s.created_at(), s.id()));
        sessions
    }

    fn get(&self, id: SessionId) -> SessionResult<Arc<Session>> {
        self.registry()
            .get(&id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    fn message_path(&self, id: SessionId) -> PathBuf {
        self.config.messages_dir().join(id.file_name())
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(i64::from(self.config.trash_retention_days))
    }

    async fn load(&self) -> SessionResult<()> {
        let records = self.records.load().await?;
        let cutoff = self.retention_cutoff();
        let mut purged = 0usize;
        let mut loaded = Vec::with_capacity(records.len());

        for record in records {
            let path = self.message_path(record.id);
            if record.trashed_at.is_some_and(|at| at < cutoff) {
                remove_message_file(&path).await;
                tracing::info!(session_id = %record.id, "Purged expired trashed session");
                purged += 1;
                continue;
            }
            let messages = read_messages(path.clone()).await.unwrap_or_else(|e| {
                tracing::warn!(
                    session_id = %record.id,
                    path = %path.display(),
                    error = %e,
                    "Failed to read message log; starting with empty history"
                );
                Vec::new()
            });
            let log = MessageLog::open(path, self.config.sync_mode);
            loaded.push(Session::new(record, messages, log, self.ctx.clone()));
        }

        let count = loaded.len();
        self.registry()
            .extend(loaded.into_iter().map(|session| (session.id(), session)));
        tracing::info!(
            sessions = count,
            purged,
            store = self.records.name(),
            "Loaded sessions"
        );

        if purged > 0 {
            self.persist_or_warn().await;
        }
        Ok(())
    }

    async fn persist(&self) -> SessionResult<()> {
        let _guard = self.persist_lock.lock().await;
        let records: Vec<SessionRecord> = self.sessions().iter().map(|s| s.record()).collect();
        self.records.save(&records).await?;
        tracing::trace!(records = records.len(), "Persisted session records");
        Ok(())
    }

    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist session records; retrying on next change");
        }
    }

    fn next_display_name(&self, worktree: &str) -> String {
        let highest = self
            .sessions()
            .iter()
            .filter(|s| s.worktree() == worktree)
            .filter_map(|s| {
                s.display_name()
                    .strip_prefix(DEFAULT_NAME_PREFIX)
                    .and_then(|n| n.trim().parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0);
        format!("{}{}", DEFAULT_NAME_PREFIX, highest + 1)
    }

    async fn insert(&self, record: SessionRecord, messages: Vec<Message>) -> SessionResult<Arc<Session>> {
        let log = MessageLog::open(self.message_path(record.id), self.config.sync_mode);
        log.rewrite(messages.clone()).await?;

        let session = Session::new(record, messages, log, self.ctx.clone());
        self.registry().insert(session.id(), Arc::clone(&session));
        self.persist_or_warn().await;
        Ok(session)
    }

    /// Unregister, stop and erase a session. Records are persisted by the caller.
    async fn remove(&self, id: SessionId) -> SessionResult<Arc<Session>> {
        let session = self
            .registry()
            .remove(&id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        session.shutdown().await;
        session.log().close().await;
        remove_message_file(session.log().path()).await;
        Ok(session)
    }
}

async fn remove_message_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove message log");
        }
    }
}

async fn run_persister(inner: Weak<ManagerInner>, trigger: Arc<Notify>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = trigger.notified() => {}
        }
        tokio::time::sleep(PERSIST_DEBOUNCE).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.persist_or_warn().await;
    }
    tracing::debug!("Session persister stopped");
}

/// Owns every session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("data_dir", &self.inner.config.data_dir)
            .field("sessions", &self.inner.registry().len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn builder(config: EngineConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            spawner: None,
            annotator: None,
            record_store: None,
        }
    }

    /// Open with the default spawner, annotator and record store.
    pub async fn open(config: EngineConfig) -> SessionResult<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub async fn create(
        &self,
        worktree: &str,
        working_dir: impl Into<PathBuf>,
    ) -> SessionResult<Arc<Session>> {
        let record = SessionRecord {
            id: SessionId::new(),
            worktree: worktree.to_string(),
            display_name: self.inner.next_display_name(worktree),
            resume_id: None,
            working_dir: working_dir.into(),
            created_at: Utc::now(),
            trashed_at: None,
        };
        let session = self.inner.insert(record, Vec::new()).await?;
        tracing::info!(
            session_id = %session.id(),
            worktree,
            name = %session.display_name(),
            "Created session"
        );
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> SessionResult<Arc<Session>> {
        self.inner.get(id)
    }

    /// Active sessions, oldest first; all worktrees when `worktree` is `None`.
    pub fn list(&self, worktree: Option<&str>) -> Vec<SessionInfo> {
        self.filtered(worktree, false)
    }

    pub fn list_trashed(&self, worktree: Option<&str>) -> Vec<SessionInfo> {
        self.filtered(worktree, true)
    }

    fn filtered(&self, worktree: Option<&str>, trashed: bool) -> Vec<SessionInfo> {
        self.inner
            .sessions()
            .iter()
            .filter(|s| worktree.is_none_or(|w| s.worktree() == w))
            .map(|s| s.info())
            .filter(|info| info.trashed_at.is_some() == trashed)
            .collect()
    }

    pub async fn rename(&self, id: SessionId, name: &str) -> SessionResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::Validation {
                message: "display name must not be empty".into(),
            });
        }
        let session = self.inner.get(id)?;
        session.rename(name);
        self.inner.persist_or_warn().await;
        Ok(())
    }

    /// Soft-delete: kill the process and close viewers. Idempotent.
    pub async fn trash(&self, id: SessionId) -> SessionResult<()> {
        let session = self.inner.get(id)?;
        if session.is_trashed() {
            return Ok(());
        }
        session.mark_trashed(Utc::now()).await;
        self.inner.persist_or_warn().await;
        tracing::info!(session_id = %id, "Session moved to trash");
        Ok(())
    }

    pub async fn restore(&self, id: SessionId) -> SessionResult<()> {
        let session = self.inner.get(id)?;
        if !session.is_trashed() {
            return Ok(());
        }
        session.mark_restored();
        self.inner.persist_or_warn().await;
        tracing::info!(session_id = %id, "Session restored from trash");
        Ok(())
    }

    /// Remove the session, its record and its message log.
    pub async fn delete(&self, id: SessionId) -> SessionResult<()> {
        self.inner.remove(id).await?;
        self.inner.persist_or_warn().await;
        tracing::info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Hard-delete trashed sessions older than the retention window.
    pub async fn purge_trashed(&self) -> SessionResult<usize> {
        let cutoff = self.inner.retention_cutoff();
        let expired: Vec<SessionId> = self
            .inner
            .sessions()
            .iter()
            .filter(|s| s.trashed_at().is_some_and(|at| at < cutoff))
            .map(|s| s.id())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut purged = 0;
        for id in expired {
            match self.inner.remove(id).await {
                Ok(_) => purged += 1,
                // Deleted concurrently.
                Err(SessionError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.inner.persist().await?;
        tracing::info!(purged, "Purged trashed sessions");
        Ok(purged)
    }

    /// The oldest active session of `worktree`, created if there is none.
    pub async fn get_or_create_default(
        &self,
        worktree: &str,
        working_dir: impl Into<PathBuf>,
    ) -> SessionResult<Arc<Session>> {
        let existing = self
            .inner
            .sessions()
            .into_iter()
            .find(|s| s.worktree() == worktree && !s.is_trashed());
        match existing {
            Some(session) => Ok(session),
            None => self.create(worktree, working_dir).await,
        }
    }

    pub fn export(&self, id: SessionId, level: ExportLevel) -> SessionResult<Transcript> {
        let session = self.inner.get(id)?;
        let source = TranscriptSource {
            session_id: Some(id.to_string()),
            display_name: session.display_name(),
            worktree: session.worktree().to_string(),
            working_dir: Some(session.working_dir().to_path_buf()),
            level,
        };
        Ok(Transcript::new(source, session.messages()))
    }

    /// Create a session from a transcript. The agent resumes it through a
    /// freshly written conversation file.
    pub async fn import(
        &self,
        transcript: &Transcript,
        worktree: &str,
        working_dir: impl Into<PathBuf>,
    ) -> SessionResult<Arc<Session>> {
        if !matches!(transcript.schema, SCHEMA_MONOLITHIC | SCHEMA_SPLIT) {
            return Err(SessionError::InvalidTranscript {
                message: format!("unsupported schema {}", transcript.schema),
            });
        }
        if transcript.messages.is_empty() {
            return Err(SessionError::InvalidTranscript {
                message: "transcript has no messages".into(),
            });
        }

        let working_dir = working_dir.into();
        let branch = detect_git_branch(&working_dir).await;
        let resume_id = self
            .inner
            .ctx
            .resume
            .write(&transcript.messages, &working_dir, branch.as_deref())
            .await?;

        let display_name = match transcript.source.display_name.trim() {
            "" => self.inner.next_display_name(worktree),
            name => name.to_string(),
        };
        let record = SessionRecord {
            id: SessionId::new(),
            worktree: worktree.to_string(),
            display_name,
            resume_id: Some(resume_id.clone()),
            working_dir,
            created_at: Utc::now(),
            trashed_at: None,
        };
        let session = self.inner.insert(record, transcript.messages.clone()).await?;
        tracing::info!(
            session_id = %session.id(),
            resume_id = %resume_id,
            messages = transcript.messages.len(),
            "Imported transcript"
        );
        Ok(session)
    }

    /// Save every record now instead of waiting for the background persister.
    pub async fn persist(&self) -> SessionResult<()> {
        self.inner.persist().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.ctx.metrics.snapshot()
    }

    /// Stop every agent, close every subscriber and save records.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.inner.shutdown.cancel();
        let sessions = self.inner.sessions();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
        self.inner.persist().await?;
        tracing::info!(sessions = sessions.len(), "Session manager shut down");
        Ok(())
    }
}
