//! Per-session NDJSON message log.
//!
//! Appends are queued to a detached writer task so callers never wait on
//! disk while holding session state; the task applies operations strictly in
//! submission order. The only destructive path is [`MessageLog::rewrite`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use super::atomic::write_atomic_sync;
use crate::config::SyncMode;
use crate::session::{SessionError, SessionResult};
use crate::types::Message;

/// Read a message log, stopping silently at the first line that does not
/// parse. A missing file is an empty history.
pub fn read_messages_sync(path: &Path) -> SessionResult<Vec<Message>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut messages = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::debug!(path = %path.display(), line = line_num + 1, "Stopping at non-UTF-8 line");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    line = line_num + 1,
                    error = %e,
                    "Stopping at unparsable message line"
                );
                break;
            }
        }
    }
    Ok(messages)
}

pub async fn read_messages(path: impl Into<PathBuf>) -> SessionResult<Vec<Message>> {
    let path = path.into();
    tokio::task::spawn_blocking(move || read_messages_sync(&path))
        .await
        .map_err(|e| SessionError::Storage {
            message: format!("Task join error: {}", e),
        })?
}

fn append_sync(path: &Path, message: &Message, sync_mode: SyncMode) -> SessionResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    if sync_mode == SyncMode::OnWrite {
        writer.get_ref().sync_all()?;
    }
    Ok(())
}

fn rewrite_sync(path: &Path, messages: &[Message], sync_mode: SyncMode) -> SessionResult<()> {
    let mut bytes = Vec::new();
    for message in messages {
        serde_json::to_writer(&mut bytes, message)?;
        bytes.push(b'\n');
    }
    write_atomic_sync(path, &bytes, sync_mode == SyncMode::OnWrite)
}

enum LogOp {
    Append(Box<Message>),
    Rewrite(Vec<Message>, oneshot::Sender<SessionResult<()>>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to a session's message file and its writer task.
#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<LogOp>,
}

impl MessageLog {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn open(path: impl Into<PathBuf>, sync_mode: SyncMode) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), sync_mode, rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an append. Failures are logged by the writer; memory is the
    /// source of truth until the next rewrite.
    pub fn append(&self, message: Message) {
        if self.tx.send(LogOp::Append(Box::new(message))).is_err() {
            tracing::debug!(path = %self.path.display(), "Message log closed, append dropped");
        }
    }

    /// Replace the whole file after every queued append has landed.
    pub async fn rewrite(&self, messages: Vec<Message>) -> SessionResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogOp::Rewrite(messages, ack))
            .map_err(|_| self.closed_error())?;
        done.await.map_err(|_| self.closed_error())?
    }

    /// Wait until every previously queued operation has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LogOp::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drain pending operations and stop the writer. Later appends are dropped.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LogOp::Close(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Storage {
            message: format!("Message log {} is closed", self.path.display()),
        }
    }
}

async fn run_writer(path: PathBuf, sync_mode: SyncMode, mut rx: mpsc::UnboundedReceiver<LogOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            LogOp::Append(message) => {
                let target = path.clone();
                let result =
                    tokio::task::spawn_blocking(move || append_sync(&target, &message, sync_mode))
                        .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to append message")
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Append task failed")
                    }
                }
            }
            LogOp::Rewrite(messages, ack) => {
                let target = path.clone();
                let result =
                    tokio::task::spawn_blocking(move || rewrite_sync(&target, &messages, sync_mode))
                        .await
                        .unwrap_or_else(|e| {
                            Err(SessionError::Storage {
                                message: format!("Task join error: {}", e),
                            })
                        });
                let _ = ack.send(result);
            }
            LogOp::Flush(ack) => {
                let _ = ack.send(());
            }
            LogOp::Close(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    tracing::trace!(path = %path.display(), "Message log writer stopped");
}
