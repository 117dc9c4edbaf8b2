//! Shared fixtures: an in-memory agent behind the `AgentSpawner` seam and a
//! manager wired to it over a temporary data directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_engine::{
    AgentProcess, AgentSpawner, DiffAnnotator, EngineConfig, LaunchSpec, SessionEvent, SessionId,
    SessionManager, Subscription,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fake agent
// ============================================================================

/// Spawner that hands the agent side of each launch to the test.
pub struct FakeAgent {
    launches: Mutex<Vec<LaunchSpec>>,
    handles: mpsc::UnboundedSender<AgentHandle>,
}

impl FakeAgent {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            handles: tx,
        });
        (agent, rx)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AgentSpawner for FakeAgent {
    async fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<AgentProcess> {
        let (engine_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
        let (agent_stdout, engine_stdout) = tokio::io::duplex(64 * 1024);
        self.launches.lock().unwrap().push(spec.clone());
        let _ = self.handles.send(AgentHandle {
            spec: spec.clone(),
            stdin: BufReader::new(agent_stdin).lines(),
            stdout: agent_stdout,
        });
        Ok(AgentProcess::from_pipes(engine_stdin, engine_stdout))
    }
}

/// The agent's end of the pipes. Dropping it closes the agent's stdout.
pub struct AgentHandle {
    pub spec: LaunchSpec,
    stdin: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
}

impl AgentHandle {
    /// Next line the engine wrote, or `None` once it closed stdin.
    pub async fn read_line(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(TIMEOUT, self.stdin.next_line())
            .await
            .expect("timed out waiting for engine input")
            .expect("agent stdin read failed")?;
        Some(serde_json::from_str(&line).expect("engine wrote invalid JSON"))
    }

    pub async fn read_json(&mut self) -> Value {
        self.read_line().await.expect("engine closed agent stdin")
    }

    pub async fn emit(&mut self, event: Value) {
        self.emit_raw(&event.to_string()).await;
    }

    pub async fn emit_all(&mut self, events: impl IntoIterator<Item = Value>) {
        for event in events {
            self.emit(event).await;
        }
    }

    /// Emit a line that nobody may be reading any more; a closed pipe is ignored.
    pub async fn emit_unread(&mut self, event: Value) {
        let line = format!("{}\n", event);
        let _ = self.stdout.write_all(line.as_bytes()).await;
        let _ = self.stdout.flush().await;
    }

    pub async fn emit_raw(&mut self, line: &str) {
        self.stdout.write_all(line.as_bytes()).await.unwrap();
        self.stdout.write_all(b"\n").await.unwrap();
        self.stdout.flush().await.unwrap();
    }
}

// ============================================================================
// Agent output builders
// ============================================================================

pub fn init(session_id: &str) -> Value {
    json!({
        "type": "system",
        "subtype": "init",
        "session_id": session_id,
        "slash_commands": ["/clear", "/review"],
        "skills": ["pdf"]
    })
}

pub fn stream(session_id: &str, event: Value) -> Value {
    json!({"type": "stream_event", "session_id": session_id, "event": event})
}

/// A streamed text block spelled out by `parts`.
pub fn text_block(session_id: &str, index: usize, parts: &[&str]) -> Vec<Value> {
    let mut events = vec![stream(
        session_id,
        json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}}),
    )];
    for part in parts {
        events.push(stream(
            session_id,
            json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": part}}),
        ));
    }
    events.push(stream(
        session_id,
        json!({"type": "content_block_stop", "index": index}),
    ));
    events
}

/// A streamed tool-use block whose input arrives in `chunks`.
pub fn tool_use_block(session_id: &str, index: usize, id: &str, name: &str, chunks: &[&str]) -> Vec<Value> {
    let mut events = vec![stream(
        session_id,
        json!({"type": "content_block_start", "index": index, "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}),
    )];
    for chunk in chunks {
        events.push(stream(
            session_id,
            json!({"type": "content_block_delta", "index": index, "delta": {"type": "input_json_delta", "partial_json": chunk}}),
        ));
    }
    events.push(stream(
        session_id,
        json!({"type": "content_block_stop", "index": index}),
    ));
    events
}

pub fn message_start(session_id: &str) -> Value {
    stream(
        session_id,
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 12, "output_tokens": 1}}}),
    )
}

pub fn tool_result(session_id: &str, tool_use_id: &str, output: &str) -> Value {
    json!({
        "type": "user",
        "session_id": session_id,
        "message": {"role": "user", "content": [{"type": "tool_result", "tool_use_id": tool_use_id, "content": output}]}
    })
}

pub fn result(session_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": "done",
        "session_id": session_id,
        "usage": {"input_tokens": 12, "output_tokens": 7}
    })
}

pub fn conversation_lost(resume_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "error_during_execution",
        "is_error": true,
        "errors": [format!("No conversation found with session ID: {}", resume_id)]
    })
}

pub fn permission_request(request_id: &str, tool: &str, input: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": "can_use_tool", "tool_name": tool, "input": input}
    })
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
pub struct Options {
    pub subscriber_buffer: Option<usize>,
    pub retention_days: Option<u32>,
    pub annotator: Option<Arc<dyn DiffAnnotator>>,
}

pub struct Harness {
    pub dir: TempDir,
    pub manager: SessionManager,
    pub agent: Arc<FakeAgent>,
    agents: mpsc::UnboundedReceiver<AgentHandle>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(Options::default()).await
    }

    pub async fn with_options(options: Options) -> Self {
        Self::open(TempDir::new().unwrap(), options).await
    }

    pub async fn open(dir: TempDir, options: Options) -> Self {
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        let mut config = EngineConfig::builder()
            .data_dir(dir.path().join("data"))
            .agent_home(dir.path().join("home"));
        if let Some(size) = options.subscriber_buffer {
            config = config.subscriber_buffer(size);
        }
        if let Some(days) = options.retention_days {
            config = config.trash_retention_days(days);
        }

        let (agent, agents) = FakeAgent::new();
        let mut builder = SessionManager::builder(config.build().unwrap()).spawner(agent.clone());
        if let Some(annotator) = options.annotator {
            builder = builder.annotator(annotator);
        }
        let manager = builder.build().await.unwrap();
        Self {
            dir,
            manager,
            agent,
            agents,
        }
    }

    /// Shut down and open a fresh manager over the same data directory.
    pub async fn reopen(self, options: Options) -> Self {
        self.manager.shutdown().await.unwrap();
        Self::open(self.dir, options).await
    }

    pub fn workdir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn agent_home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn log_path(&self, id: SessionId) -> PathBuf {
        self.manager
            .config()
            .messages_dir()
            .join(format!("{}.jsonl", id))
    }

    pub async fn next_agent(&mut self) -> AgentHandle {
        tokio::time::timeout(TIMEOUT, self.agents.recv())
            .await
            .expect("timed out waiting for an agent launch")
            .expect("spawner dropped")
    }
}

// ============================================================================
// Waiting helpers
// ============================================================================

pub async fn recv(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

/// Events up to and including the next `TurnComplete`.
pub async fn collect_turn(sub: &mut Subscription) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = recv(sub).await;
        let done = matches!(event, SessionEvent::TurnComplete);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Events up to and including the first one of `kind`.
pub async fn collect_until(sub: &mut Subscription, kind: &str) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = recv(sub).await;
        let done = event.kind() == kind;
        events.push(event);
        if done {
            return events;
        }
    }
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn kinds(events: &[SessionEvent]) -> Vec<String> {
    events.iter().map(|e| e.kind().to_string()).collect()
}
