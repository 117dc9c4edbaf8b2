//! Per-process stdout reader.
//!
//! One task per launched agent. Each line is decoded, applied to session
//! state under the state lock, enriched outside it and finally published.
//! Bookkeeping is skipped once the task's generation is no longer current.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::process::{AgentStdout, terminate};
use super::runtime::SessionState;
use super::{Session, SessionEvent};
use crate::annotate::is_file_edit_tool;
use crate::protocol::{AgentEvent, DecodedLine, StreamEvent, decode_line, signals_conversation_lost};
use crate::resume::detect_git_branch;
use crate::types::{ContentBlock, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(super) async fn run(
    session: Arc<Session>,
    generation: u64,
    stdout: AgentStdout,
    child: Option<Child>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(session_id = %session.id, generation, "Reader cancelled");
                break;
            }
            next = lines.next_line() => next,
        };

        match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line(&line) {
                    Ok(decoded) => {
                        session.ctx.metrics.events_parsed.inc();
                        if session.handle_line(generation, decoded).await == Flow::Stop {
                            break;
                        }
                    }
                    Err(e) => {
                        session.ctx.metrics.malformed_lines.inc();
                        tracing::warn!(
                            session_id = %session.id,
                            generation,
                            error = %e,
                            line_len = line.len(),
                            "Skipping malformed agent output"
                        );
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(session_id = %session.id, generation, "Agent closed stdout");
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                session.ctx.metrics.malformed_lines.inc();
                tracing::warn!(session_id = %session.id, generation, error = %e, "Skipping non-UTF-8 agent output");
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, generation, error = %e, "Failed to read agent output");
                break;
            }
        }
    }

    terminate(child).await;
    session.ctx.metrics.running_processes.dec();
    session.reader_exited(generation).await;
}

impl Session {
    async fn handle_line(&self, generation: u64, decoded: DecodedLine) -> Flow {
        let DecodedLine { raw, event } = decoded;

        if let AgentEvent::Result(result) = &event
            && signals_conversation_lost(result)
        {
            if self.recover(generation).await {
                self.publish(&[SessionEvent::Agent(raw)]);
            }
            return Flow::Stop;
        }

        let mut persist = false;
        let mut turn_complete = false;
        let finished: Vec<ContentBlock> = {
            let mut st = self.state();
            if !st.is_current(generation) {
                return Flow::Stop;
            }

            if !event.is_error_result()
                && let Some(id) = event.session_id()
                && st.resume_id.as_deref() != Some(id)
            {
                tracing::debug!(session_id = %self.id, resume_id = id, "Captured upstream session id");
                st.resume_id = Some(id.to_string());
                persist = true;
            }

            match event {
                AgentEvent::System(system) if system.is_init() => {
                    st.commands = system.commands();
                    Vec::new()
                }
                AgentEvent::Stream(envelope) => match envelope.event {
                    StreamEvent::MessageStart { message } => {
                        if message.usage.is_some() {
                            st.usage = message.usage;
                        }
                        Vec::new()
                    }
                    StreamEvent::ContentBlockStart { content_block, .. } => {
                        st.turn.start_block(content_block);
                        Vec::new()
                    }
                    StreamEvent::ContentBlockDelta { delta, .. } => {
                        st.turn.push_delta(delta);
                        Vec::new()
                    }
                    StreamEvent::ContentBlockStop { .. } => {
                        st.turn.finish_block().into_iter().collect()
                    }
                    StreamEvent::MessageDelta { usage: Some(delta) } => {
                        st.usage.get_or_insert_default().output_tokens = delta.output_tokens;
                        Vec::new()
                    }
                    _ => Vec::new(),
                },
                AgentEvent::Assistant(assistant) => {
                    if assistant.message.usage.is_some() {
                        st.usage = assistant.message.usage;
                    }
                    if st.turn.is_streamed() {
                        Vec::new()
                    } else {
                        assistant.blocks()
                    }
                }
                AgentEvent::User(user) => {
                    for block in user.tool_results() {
                        st.turn.push(block);
                    }
                    Vec::new()
                }
                AgentEvent::Result(result) => {
                    if result.usage.is_some() {
                        st.usage = result.usage;
                    }
                    self.flush_turn(&mut st);
                    st.turn.clear();
                    st.run.generating = false;
                    st.pending_permission = None;
                    turn_complete = true;
                    Vec::new()
                }
                AgentEvent::ControlRequest(request) if request.is_permission_request() => {
                    tracing::debug!(
                        session_id = %self.id,
                        request_id = %request.request_id,
                        tool = ?request.tool_name(),
                        "Agent is waiting for permission"
                    );
                    self.flush_turn(&mut st);
                    st.pending_permission = Some(Arc::clone(&raw));
                    Vec::new()
                }
                AgentEvent::ControlRequest(request) => {
                    tracing::debug!(
                        session_id = %self.id,
                        request_id = %request.request_id,
                        subtype = ?request.subtype(),
                        "Forwarding control request"
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };

        let mut events = vec![SessionEvent::Agent(raw)];
        if !finished.is_empty() {
            let (blocks, annotations) = self.annotate(finished).await;
            let mut st = self.state();
            if !st.is_current(generation) {
                return Flow::Stop;
            }
            for block in blocks {
                st.turn.push(block);
            }
            events.extend(annotations);
        }
        if turn_complete {
            events.push(SessionEvent::TurnComplete);
        }

        if persist {
            self.request_persist();
        }
        self.publish(&events);
        Flow::Continue
    }

    /// Move accumulated blocks into one assistant message and queue it for disk.
    fn flush_turn(&self, st: &mut SessionState) {
        let blocks = st.turn.take();
        if blocks.is_empty() {
            return;
        }
        let message = Message::assistant(blocks);
        st.messages.push(message.clone());
        self.log.append(message);
    }

    /// Attach diff annotations to edit/write tool uses.
    async fn annotate(&self, blocks: Vec<ContentBlock>) -> (Vec<ContentBlock>, Vec<SessionEvent>) {
        let mut out = Vec::with_capacity(blocks.len());
        let mut events = Vec::new();
        for mut block in blocks {
            if let ContentBlock::ToolUse(tool_use) = &mut block
                && is_file_edit_tool(&tool_use.name)
            {
                let annotator = Arc::clone(&self.ctx.annotator);
                let working_dir = self.working_dir.clone();
                let target = tool_use.clone();
                let annotation = tokio::task::spawn_blocking(move || {
                    annotator.annotate(&target, &working_dir)
                })
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(session_id = %self.id, error = %e, "Annotator panicked");
                    None
                });
                if let Some(annotation) = annotation {
                    tool_use.diff_annotation = Some(annotation.clone());
                    events.push(SessionEvent::AnnotationReady {
                        tool_use_id: tool_use.id.clone(),
                        annotation,
                    });
                }
            }
            out.push(block);
        }
        (out, events)
    }

    /// Rebuild the upstream conversation from local history after the agent
    /// reported it lost the one being resumed. Returns false when the
    /// generation was already stale and nothing was done.
    async fn recover(&self, generation: u64) -> bool {
        let (messages, lost) = {
            let mut st = self.state();
            if !st.is_current(generation) {
                return false;
            }
            st.run.generating = false;
            st.pending_permission = None;
            st.turn.clear();
            (st.messages.clone(), st.resume_id.clone())
        };
        tracing::warn!(
            session_id = %self.id,
            generation,
            lost_resume_id = ?lost,
            messages = messages.len(),
            "Agent lost the conversation, rebuilding resume file"
        );

        let resume_id = if messages.is_empty() {
            None
        } else {
            let branch = detect_git_branch(&self.working_dir).await;
            match self
                .ctx
                .resume
                .write(&messages, &self.working_dir, branch.as_deref())
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "Failed to write resume file, starting fresh");
                    None
                }
            }
        };

        if self.finish_recovery(generation, resume_id) {
            self.ctx.metrics.recoveries.inc();
            self.request_persist();
        }
        true
    }

    /// Install the rebuilt resume id unless the process was cancelled or the
    /// session reset while the conversation file was being written.
    fn finish_recovery(&self, generation: u64, resume_id: Option<String>) -> bool {
        let mut st = self.state();
        if !st.is_current(generation) {
            tracing::info!(
                session_id = %self.id,
                generation,
                discarded = ?resume_id,
                "Session changed during recovery, discarding rebuilt conversation"
            );
            return false;
        }
        tracing::info!(session_id = %self.id, resume_id = ?resume_id, "Conversation recovered");
        st.resume_id = resume_id;
        true
    }

    /// Generation-checked cleanup after the process is gone.
    async fn reader_exited(&self, generation: u64) {
        let was_current = {
            let mut st = self.state();
            let current = st.is_current(generation);
            if current {
                st.stop_running();
            }
            current
        };
        if was_current {
            let mut slot = self.stdin.lock().await;
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                *slot = None;
            }
        }
        tracing::debug!(session_id = %self.id, generation, current = was_current, "Reader exited");
    }
}
