//! Launching the agent subprocess.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use super::SessionId;

pub type AgentStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type AgentStdout = Box<dyn AsyncRead + Send + Unpin>;

/// What a spawner needs to start one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub session_id: SessionId,
    pub working_dir: PathBuf,
    pub resume_id: Option<String>,
}

impl LaunchSpec {
    /// Command-line arguments for stream-json mode with the stdio
    /// permission broker.
    pub fn args(&self, extra: &[String]) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        if let Some(resume_id) = self.resume_id.as_deref().filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(resume_id.to_string());
        }
        args.extend(extra.iter().cloned());
        args
    }
}

/// A running agent: its pipes plus the OS process when there is one.
pub struct AgentProcess {
    pub stdin: AgentStdin,
    pub stdout: AgentStdout,
    child: Option<Child>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("pid", &self.child.as_ref().and_then(|c| c.id()))
            .finish_non_exhaustive()
    }
}

impl AgentProcess {
    /// Pipes not backed by an OS process (in-memory agents).
    pub fn from_pipes(
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: None,
        }
    }

    pub fn from_child(mut child: Child) -> std::io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdout not piped"))?;
        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub(crate) fn into_parts(self) -> (AgentStdin, AgentStdout, Option<Child>) {
        (self.stdin, self.stdout, self.child)
    }
}

/// Kill and reap a child. No-op for in-memory agents.
pub(crate) async fn terminate(child: Option<Child>) {
    if let Some(mut child) = child {
        if let Err(e) = child.start_kill() {
            tracing::trace!(error = %e, "Agent already exited");
        }
        match child.wait().await {
            Ok(status) => tracing::debug!(?status, "Agent process exited"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap agent process"),
        }
    }
}

/// Starts agent processes for sessions.
#[async_trait::async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<AgentProcess>;
}

/// Spawns the agent binary as an OS process.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    binary: PathBuf,
    extra_args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait::async_trait]
impl AgentSpawner for CommandSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<AgentProcess> {
        let mut child = Command::new(&self.binary)
            .args(spec.args(&self.extra_args))
            .current_dir(&spec.working_dir)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = spec.session_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, stderr = %line, "Agent stderr");
                }
            });
        }

        tracing::info!(
            session_id = %spec.session_id,
            pid = ?child.id(),
            resume = spec.resume_id.is_some(),
            "Started agent process"
        );
        AgentProcess::from_child(child)
    }
}
