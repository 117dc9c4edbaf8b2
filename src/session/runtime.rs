//! The session object and its caller-facing operations.
//!
//! Two locks guard a session. `state` is a plain mutex over everything the
//! reader task and callers share; it is never held across an await. `stdin`
//! serializes writes to the agent and owns the pipe. Whenever both are
//! needed, `stdin` is taken first and `state` only briefly inside it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::accumulator::TurnAccumulator;
use super::process::{AgentSpawner, AgentStdin, LaunchSpec};
use super::subscribers::{SubscriberId, SubscriberSet, Subscription, fan_out};
use super::{
    SessionError, SessionEvent, SessionId, SessionInfo, SessionResult, SessionStatus, reader,
};
use crate::annotate::DiffAnnotator;
use crate::observability::EngineMetrics;
use crate::protocol::{PermissionDecision, UserTurn};
use crate::resume::ResumeWriter;
use crate::store::{MessageLog, SessionRecord};
use crate::types::{ContentBlock, Message, TokenUsage, TranscriptStats};

/// Collaborators shared by every session of a manager.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub spawner: Arc<dyn AgentSpawner>,
    pub annotator: Arc<dyn DiffAnnotator>,
    pub resume: ResumeWriter,
    pub metrics: Arc<EngineMetrics>,
    pub persist: Arc<Notify>,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Default)]
pub(super) struct RunState {
    /// Bumped on every launch; only the reader of the current generation
    /// may clear running state.
    pub generation: u64,
    /// Bumped whenever running state is torn down. A `send` that sees it move
    /// while waiting for stdin gives up instead of launching.
    pub epoch: u64,
    pub running: bool,
    pub starting: bool,
    pub generating: bool,
    pub cancel: Option<CancellationToken>,
}

pub(super) struct SessionState {
    pub display_name: String,
    pub resume_id: Option<String>,
    pub trashed_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    pub run: RunState,
    pub pending_permission: Option<Arc<serde_json::Value>>,
    pub turn: TurnAccumulator,
    pub usage: Option<TokenUsage>,
    pub commands: Vec<String>,
    pub subscribers: SubscriberSet,
}

impl SessionState {
    pub fn is_current(&self, generation: u64) -> bool {
        self.run.running && self.run.generation == generation
    }

    fn status(&self) -> SessionStatus {
        if !self.run.running {
            SessionStatus::Idle
        } else if self.run.starting {
            SessionStatus::Starting
        } else if self.pending_permission.is_some() {
            SessionStatus::WaitingForPermission
        } else if self.run.generating {
            SessionStatus::Generating
        } else {
            SessionStatus::Ready
        }
    }

    /// Drop all in-flight turn state after the process went away.
    pub fn stop_running(&mut self) {
        self.run.epoch += 1;
        self.run.running = false;
        self.run.starting = false;
        self.run.generating = false;
        self.run.cancel = None;
        self.pending_permission = None;
        self.turn.clear();
    }
}

pub(super) struct StdinSlot {
    pub generation: u64,
    pub stdin: AgentStdin,
}

pub struct Session {
    pub(super) id: SessionId,
    pub(super) worktree: String,
    pub(super) working_dir: PathBuf,
    pub(super) created_at: DateTime<Utc>,
    pub(super) state: Mutex<SessionState>,
    pub(super) stdin: tokio::sync::Mutex<Option<StdinSlot>>,
    pub(super) log: MessageLog,
    pub(super) ctx: SessionContext,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("worktree", &self.worktree)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        record: SessionRecord,
        messages: Vec<Message>,
        log: MessageLog,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let subscribers = SubscriberSet::new(ctx.subscriber_buffer);
        Arc::new(Self {
            id: record.id,
            worktree: record.worktree,
            working_dir: record.working_dir,
            created_at: record.created_at,
            state: Mutex::new(SessionState {
                display_name: record.display_name,
                resume_id: record.resume_id.filter(|id| !id.is_empty()),
                trashed_at: record.trashed_at,
                messages,
                run: RunState::default(),
                pending_permission: None,
                turn: TurnAccumulator::new(),
                usage: None,
                commands: Vec::new(),
                subscribers,
            }),
            stdin: tokio::sync::Mutex::new(None),
            log,
            ctx,
        })
    }

    pub(super) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn worktree(&self) -> &str {
        &self.worktree
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn display_name(&self) -> String {
        self.state().display_name.clone()
    }

    pub fn resume_id(&self) -> Option<String> {
        self.state().resume_id.clone()
    }

    pub fn trashed_at(&self) -> Option<DateTime<Utc>> {
        self.state().trashed_at
    }

    pub fn is_trashed(&self) -> bool {
        self.state().trashed_at.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status()
    }

    pub fn is_generating(&self) -> bool {
        self.state().run.generating
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }

    pub fn stats(&self) -> TranscriptStats {
        TranscriptStats::from_messages(&self.state().messages)
    }

    /// Usage reported for the most recent turn.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.state().usage
    }

    /// Slash commands and skills advertised by the agent at startup.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// The unanswered `control_request`, for viewers that connect late.
    pub fn pending_permission(&self) -> Option<Arc<serde_json::Value>> {
        self.state().pending_permission.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let st = self.state();
        SessionInfo {
            id: self.id,
            worktree: self.worktree.clone(),
            display_name: st.display_name.clone(),
            resume_id: st.resume_id.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            trashed_at: st.trashed_at,
            status: st.status(),
            message_count: st.messages.len(),
            usage: st.usage,
        }
    }

    pub fn record(&self) -> SessionRecord {
        let st = self.state();
        SessionRecord {
            id: self.id,
            worktree: self.worktree.clone(),
            display_name: st.display_name.clone(),
            resume_id: st.resume_id.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            trashed_at: st.trashed_at,
        }
    }

    pub(crate) fn log(&self) -> &MessageLog {
        &self.log
    }

    pub(super) fn request_persist(&self) {
        self.ctx.persist.notify_one();
    }

    /// Send a plain-text user turn. Rejected with [`SessionError::Busy`]
    /// while a response is being generated.
    pub async fn send(self: &Arc<Self>, text: impl Into<String>) -> SessionResult<()> {
        self.send_content(vec![ContentBlock::text(text)]).await
    }

    pub async fn send_content(self: &Arc<Self>, content: Vec<ContentBlock>) -> SessionResult<()> {
        let line = UserTurn::with_content(content.clone()).to_line()?;
        let message = Message::user_with_content(content);

        let epoch = {
            let mut st = self.state();
            if st.trashed_at.is_some() {
                return Err(SessionError::Trashed {
                    id: self.id.to_string(),
                });
            }
            if st.run.generating {
                self.ctx.metrics.busy_rejections.inc();
                return Err(SessionError::Busy {
                    id: self.id.to_string(),
                });
            }
            st.run.generating = true;
            st.messages.push(message.clone());
            self.log.append(message);
            st.run.epoch
        };

        let mut slot = self.stdin.lock().await;
        let result = match self.ensure_locked(&mut slot, Some(epoch)).await {
            Ok(()) => write_line(&mut slot, line.as_bytes()).await,
            Err(e) => Err(e),
        };

        match &result {
            // Teardown already cleared `generating`.
            Err(SessionError::Cancelled { .. }) => {
                tracing::debug!(session_id = %self.id, "User turn cancelled before delivery");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to deliver user turn");
                if matches!(e, SessionError::Io(_)) {
                    *slot = None;
                }
                self.state().run.generating = false;
            }
            Ok(()) => {}
        }
        result
    }

    /// Start the agent unless it is already running.
    pub async fn ensure_process(self: &Arc<Self>) -> SessionResult<()> {
        let mut slot = self.stdin.lock().await;
        self.ensure_locked(&mut slot, None).await
    }

    /// Launch under the stdin lock. With `epoch`, fails with
    /// [`SessionError::Cancelled`] if running state was torn down since the
    /// caller read it.
    async fn ensure_locked(
        self: &Arc<Self>,
        slot: &mut Option<StdinSlot>,
        epoch: Option<u64>,
    ) -> SessionResult<()> {
        let (generation, spec, token) = {
            let mut st = self.state();
            if epoch.is_some_and(|e| e != st.run.epoch) {
                return Err(SessionError::Cancelled {
                    id: self.id.to_string(),
                });
            }
            if let Some(current) = slot.as_ref()
                && st.is_current(current.generation)
            {
                return Ok(());
            }
            st.run.generation += 1;
            st.run.running = true;
            st.run.starting = true;
            let token = CancellationToken::new();
            st.run.cancel = Some(token.clone());
            let spec = LaunchSpec {
                session_id: self.id,
                working_dir: self.working_dir.clone(),
                resume_id: st.resume_id.clone(),
            };
            (st.run.generation, spec, token)
        };

        let process = match self.ctx.spawner.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                let mut st = self.state();
                if st.run.generation == generation {
                    st.run.running = false;
                    st.run.starting = false;
                    st.run.cancel = None;
                }
                tracing::error!(session_id = %self.id, generation, error = %e, "Failed to start agent");
                return Err(SessionError::Spawn {
                    message: e.to_string(),
                });
            }
        };

        {
            let mut st = self.state();
            if st.run.generation == generation {
                st.run.starting = false;
            }
        }
        self.ctx.metrics.processes_started.inc();
        self.ctx.metrics.running_processes.inc();
        tracing::debug!(
            session_id = %self.id,
            generation,
            resume_id = ?spec.resume_id,
            "Agent process started"
        );

        let (stdin, stdout, child) = process.into_parts();
        *slot = Some(StdinSlot { generation, stdin });
        tokio::spawn(reader::run(
            Arc::clone(self),
            generation,
            stdout,
            child,
            token,
        ));
        Ok(())
    }

    /// Forward an already-serialized control response to the agent.
    pub async fn write_raw_control_response(&self, data: &[u8]) -> SessionResult<()> {
        {
            let mut slot = self.stdin.lock().await;
            if slot.is_none() {
                return Err(SessionError::NotRunning {
                    id: self.id.to_string(),
                });
            }
            if let Err(e) = write_line(&mut slot, data).await {
                *slot = None;
                return Err(e);
            }
        }
        self.state().pending_permission = None;
        Ok(())
    }

    /// Answer the pending `can_use_tool` request.
    pub async fn respond_permission(&self, decision: PermissionDecision) -> SessionResult<()> {
        let request_id = self
            .state()
            .pending_permission
            .as_ref()
            .and_then(|raw| raw.get("request_id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| SessionError::NoPendingPermission {
                id: self.id.to_string(),
            })?;
        let line = decision.to_line(&request_id)?;
        self.write_raw_control_response(line.as_bytes()).await
    }

    /// Kill the agent. History and resume id are kept; a partial turn is dropped.
    ///
    /// Holds the stdin lock for the whole teardown, so a launch by a `send`
    /// queued ahead of it is killed too and one queued behind it gives up.
    pub async fn cancel(&self) {
        let mut slot = self.stdin.lock().await;
        let token = {
            let mut st = self.state();
            let token = st.run.cancel.take();
            st.stop_running();
            token
        };
        if let Some(token) = token {
            tracing::info!(session_id = %self.id, "Cancelling agent process");
            token.cancel();
        }
        *slot = None;
    }

    /// Kill the agent and forget the conversation, on disk as well.
    pub async fn reset(&self) -> SessionResult<()> {
        self.cancel().await;
        {
            let mut st = self.state();
            st.resume_id = None;
            st.messages.clear();
            st.usage = None;
        }
        self.request_persist();
        self.log.rewrite(Vec::new()).await?;
        tracing::info!(session_id = %self.id, "Session reset");
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.state().subscribers.subscribe()
    }

    /// Close a subscription. Returns false when it was already closed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.state().subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub(super) fn publish(&self, events: &[SessionEvent]) {
        let targets = self.state().subscribers.snapshot();
        if targets.is_empty() {
            return;
        }
        let mut closed: Vec<SubscriberId> = Vec::new();
        for event in events {
            let delivery = fan_out(&targets, event);
            self.ctx.metrics.events_dropped.add(delivery.dropped as u64);
            closed.extend(delivery.closed);
        }
        if !closed.is_empty() {
            closed.sort_unstable();
            closed.dedup();
            self.state().subscribers.remove_all(&closed);
        }
    }

    pub(crate) fn rename(&self, name: impl Into<String>) {
        self.state().display_name = name.into();
    }

    pub(crate) async fn mark_trashed(&self, at: DateTime<Utc>) {
        self.cancel().await;
        let mut st = self.state();
        st.trashed_at = Some(at);
        st.subscribers.close_all();
    }

    pub(crate) fn mark_restored(&self) {
        self.state().trashed_at = None;
    }

    /// Cancel the process, close viewers and flush pending log writes.
    pub(crate) async fn shutdown(&self) {
        self.cancel().await;
        self.state().subscribers.close_all();
        self.log.flush().await;
    }
}

async fn write_line(slot: &mut Option<StdinSlot>, data: &[u8]) -> SessionResult<()> {
    let Some(slot) = slot.as_mut() else {
        return Err(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "agent stdin closed",
        )));
    };
    slot.stdin.write_all(data).await?;
    if !data.ends_with(b"\n") {
        slot.stdin.write_all(b"\n").await?;
    }
    slot.stdin.flush().await?;
    Ok(())
}
