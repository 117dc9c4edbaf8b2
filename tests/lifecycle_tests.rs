//! Session lifecycle: busy rejection, cancel, reset, crash recovery,
//! permissions, trash and restart.

mod common;

use std::io::Write;

use agent_engine::store::read_messages_sync;
use agent_engine::{
    Error, ErrorCategory, PermissionDecision, ResumeWriter, SessionError, SessionStatus,
};
use common::*;
use serde_json::json;

/// Drive one complete text turn. The returned handle keeps the process alive.
async fn complete_turn(
    h: &mut Harness,
    session: &agent_engine::Session,
    upstream: &str,
    reply: &str,
) -> AgentHandle {
    let mut sub = session.subscribe();
    let mut agent = h.next_agent().await;
    agent.read_json().await;
    agent.emit(init(upstream)).await;
    agent.emit_all(text_block(upstream, 0, &[reply])).await;
    agent.emit(result(upstream)).await;
    collect_turn(&mut sub).await;
    session.unsubscribe(sub.id());
    agent
}

// ============================================================================
// At-most-one-in-flight
// ============================================================================

#[tokio::test]
async fn test_send_while_generating_is_busy() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();

    session.send("first").await.unwrap();
    let mut agent = h.next_agent().await;
    assert_eq!(agent.read_json().await["message"]["content"][0]["text"], "first");

    let err = session.send("second").await.unwrap_err();
    assert!(matches!(err, SessionError::Busy { .. }));
    let err: Error = err.into();
    assert_eq!(err.category(), ErrorCategory::Busy);
    assert!(err.is_caller_actionable());

    assert_eq!(session.message_count(), 1);
    assert_eq!(h.agent.launches().len(), 1);
    assert_eq!(h.manager.metrics().busy_rejections, 1);

    // Once the turn completes the next send goes to the same process.
    let mut sub = session.subscribe();
    agent.emit(result("up-1")).await;
    collect_turn(&mut sub).await;
    session.send("second").await.unwrap();
    assert_eq!(agent.read_json().await["message"]["content"][0]["text"], "second");
    assert_eq!(h.agent.launches().len(), 1);
    assert_eq!(session.message_count(), 2);
}

// ============================================================================
// Cancel and reset
// ============================================================================

#[tokio::test]
async fn test_cancel_keeps_history_and_drops_partial_turn() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut first = complete_turn(&mut h, &session, "up-1", "Hi").await;

    session.send("write a novel").await.unwrap();
    first.read_json().await;
    // Same process: no new launch was needed.
    assert_eq!(h.agent.launches().len(), 1);

    session.cancel().await;
    assert_eq!(session.status(), SessionStatus::Idle);
    assert!(!session.is_generating());
    assert_eq!(session.message_count(), 3);
    assert_eq!(session.resume_id().as_deref(), Some("up-1"));

    // The next send relaunches and resumes the upstream conversation.
    session.send("shorter please").await.unwrap();
    let mut agent = h.next_agent().await;
    assert_eq!(agent.spec.resume_id.as_deref(), Some("up-1"));
    assert!(agent.spec.args(&[]).windows(2).any(|w| w == ["--resume", "up-1"]));
    agent.read_json().await;
}

#[tokio::test]
async fn test_cancel_closes_agent_stdin() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;

    session.cancel().await;
    assert!(agent.read_line().await.is_none());
    wait_until("running gauge back to zero", || {
        h.manager.metrics().running_processes == 0
    })
    .await;
}

#[tokio::test]
async fn test_cancelled_process_output_is_ignored_after_relaunch() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut old = complete_turn(&mut h, &session, "up-1", "Hi").await;

    session.send("long task").await.unwrap();
    old.read_json().await;
    session.cancel().await;

    session.send("relaunch").await.unwrap();
    let mut new = h.next_agent().await;
    assert_eq!(new.read_json().await["message"]["content"][0]["text"], "relaunch");
    let mut sub = session.subscribe();

    // The cancelled process finishes its turn anyway, then exits.
    for event in text_block("up-old", 0, &["stale"]) {
        old.emit_unread(event).await;
    }
    old.emit_unread(result("up-old")).await;
    drop(old);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(session.status(), SessionStatus::Generating);
    assert_eq!(session.message_count(), 4);
    assert_eq!(session.resume_id().as_deref(), Some("up-1"));
    assert!(sub.try_recv().is_none());

    // The new process still owns stdin and completes the turn.
    new.emit_all(text_block("up-1", 0, &["fresh"])).await;
    new.emit(result("up-1")).await;
    collect_turn(&mut sub).await;
    assert_eq!(session.message_count(), 5);
    assert_eq!(session.messages()[4].text(), "fresh");

    session.send("again").await.unwrap();
    assert_eq!(new.read_json().await["message"]["content"][0]["text"], "again");
    assert_eq!(h.agent.launches().len(), 2);
}

#[tokio::test]
async fn test_reset_clears_history_and_log() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let _agent = complete_turn(&mut h, &session, "up-1", "Hi").await;

    let path = h.log_path(session.id());
    wait_until("turn on disk", || read_messages_sync(&path).unwrap().len() == 2).await;

    session.reset().await.unwrap();
    assert!(session.messages().is_empty());
    assert_eq!(session.resume_id(), None);
    assert_eq!(session.status(), SessionStatus::Idle);
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 0);

    // A fresh conversation starts without --resume.
    session.send("again").await.unwrap();
    let agent = h.next_agent().await;
    assert_eq!(agent.spec.resume_id, None);
    wait_until("new message on disk", || read_messages_sync(&path).unwrap().len() == 1).await;
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn test_lost_conversation_is_rebuilt() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut sub = session.subscribe();
    let mut agent = h.next_agent().await;
    agent.read_json().await;
    agent.emit(init("up-1")).await;
    agent.emit_all(text_block("up-1", 0, &["Hi"])).await;
    agent.emit(result("up-1")).await;
    collect_turn(&mut sub).await;
    let before = session.messages();

    // The agent reports the resumed conversation is gone.
    agent.emit(conversation_lost("up-1")).await;
    let events = collect_until(&mut sub, "result").await;
    assert_eq!(events.last().unwrap().to_json()["is_error"], true);

    wait_until("process stopped", || session.status() == SessionStatus::Idle).await;
    let resume_id = session.resume_id().expect("recovery assigns a resume id");
    assert_ne!(resume_id, "up-1");
    assert!(!resume_id.is_empty());
    assert_eq!(session.messages(), before);
    assert_eq!(h.manager.metrics().recoveries, 1);

    let conversation = ResumeWriter::new(h.agent_home()).conversation_path(&h.workdir(), &resume_id);
    let lines = std::fs::read_to_string(&conversation).unwrap();
    assert_eq!(lines.lines().count(), 2);
    let first: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
    assert_eq!(first["type"], "user");
    assert_eq!(first["sessionId"], resume_id.as_str());

    // Nothing special is needed to continue.
    session.send("still there?").await.unwrap();
    let mut relaunched = h.next_agent().await;
    assert_eq!(relaunched.spec.resume_id.as_deref(), Some(resume_id.as_str()));
    relaunched.read_json().await;
    assert_eq!(session.message_count(), before.len() + 1);

    wait_until("recovered id persisted", || {
        let records = std::fs::read_to_string(h.manager.config().records_path()).unwrap_or_default();
        records.contains(&resume_id)
    })
    .await;
}

#[tokio::test]
async fn test_lost_conversation_without_history_starts_fresh() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    let mut sub = session.subscribe();

    session.ensure_process().await.unwrap();
    let mut agent = h.next_agent().await;
    agent.emit(init("up-1")).await;
    recv(&mut sub).await;
    assert_eq!(session.resume_id().as_deref(), Some("up-1"));

    agent.emit(conversation_lost("up-1")).await;
    recv(&mut sub).await;
    wait_until("process stopped", || session.status() == SessionStatus::Idle).await;
    assert_eq!(session.resume_id(), None);
}

#[tokio::test]
async fn test_process_exit_keeps_history() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;
    agent.emit(init("up-1")).await;
    agent.emit_all(text_block("up-1", 0, &["partial"])).await;
    drop(agent);

    wait_until("reader exit", || session.status() == SessionStatus::Idle).await;
    assert!(!session.is_generating());
    assert_eq!(session.message_count(), 1);
    assert_eq!(session.resume_id().as_deref(), Some("up-1"));
}

// ============================================================================
// Permissions
// ============================================================================

#[tokio::test]
async fn test_permission_round_trip() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    let mut sub = session.subscribe();
    session.send("list files").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;

    agent.emit_all(text_block("up-1", 0, &["Let me look."])).await;
    agent
        .emit_all(tool_use_block("up-1", 1, "tu_1", "Bash", &[r#"{"command":"ls"}"#]))
        .await;
    agent
        .emit(permission_request("req-1", "Bash", json!({"command": "ls"})))
        .await;
    collect_until(&mut sub, "control_request").await;

    assert_eq!(session.status(), SessionStatus::WaitingForPermission);
    assert_eq!(session.pending_permission().unwrap()["request_id"], "req-1");
    // Blocks before the request are already persisted as one message.
    assert_eq!(session.message_count(), 2);
    assert_eq!(session.messages()[1].content.len(), 2);

    session
        .respond_permission(PermissionDecision::allow(json!({"command": "ls"})))
        .await
        .unwrap();
    let response = agent.read_json().await;
    assert_eq!(response["type"], "control_response");
    assert_eq!(response["response"]["request_id"], "req-1");
    assert_eq!(response["response"]["response"]["behavior"], "allow");
    assert_eq!(session.status(), SessionStatus::Generating);
    assert!(session.pending_permission().is_none());

    agent.emit(tool_result("up-1", "tu_1", "Cargo.toml")).await;
    agent.emit_all(text_block("up-1", 2, &["One file."])).await;
    agent.emit(result("up-1")).await;
    collect_turn(&mut sub).await;

    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content.len(), 2);
    assert_eq!(messages[2].text(), "One file.");
}

#[tokio::test]
async fn test_raw_control_response_is_forwarded() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("go").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;

    let raw = json!({"type": "control_response", "response": {"subtype": "success", "request_id": "x"}});
    session
        .write_raw_control_response(raw.to_string().as_bytes())
        .await
        .unwrap();
    assert_eq!(agent.read_json().await, raw);
}

// ============================================================================
// Trash and purge
// ============================================================================

#[tokio::test]
async fn test_trash_stops_process_and_purge_removes_data() {
    let mut h = Harness::with_options(Options {
        retention_days: Some(0),
        ..Options::default()
    })
    .await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    let other = h.manager.create("main", h.workdir()).await.unwrap();
    session.send("hello").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;
    let mut sub = session.subscribe();

    h.manager.trash(session.id()).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Idle);
    assert!(agent.read_line().await.is_none());
    assert!(sub.recv().await.is_none());
    assert!(matches!(
        session.send("anyone?").await,
        Err(SessionError::Trashed { .. })
    ));

    let active: Vec<_> = h.manager.list(Some("main")).into_iter().map(|i| i.id).collect();
    let trashed: Vec<_> = h.manager.list_trashed(Some("main")).into_iter().map(|i| i.id).collect();
    assert_eq!(active, vec![other.id()]);
    assert_eq!(trashed, vec![session.id()]);

    let path = h.log_path(session.id());
    assert!(path.exists());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(h.manager.purge_trashed().await.unwrap(), 1);
    assert!(!path.exists());
    assert!(h.manager.list_trashed(None).is_empty());
    assert_eq!(h.manager.list(None).len(), 1);
}

#[tokio::test]
async fn test_restore_returns_session_to_listing() {
    let h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    h.manager.trash(session.id()).await.unwrap();
    h.manager.restore(session.id()).await.unwrap();

    assert_eq!(h.manager.list(Some("main")).len(), 1);
    assert!(h.manager.list_trashed(None).is_empty());
    assert!(!session.is_trashed());
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_reopen_restores_sessions_and_tolerates_truncated_log() {
    let mut h = Harness::new().await;
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    h.manager.rename(session.id(), "Bug hunt").await.unwrap();
    session.send("hello").await.unwrap();
    let agent = complete_turn(&mut h, &session, "up-9", "Hi").await;
    let id = session.id();
    let path = h.log_path(id);
    drop(agent);
    drop(session);

    h.manager.shutdown().await.unwrap();
    assert_eq!(read_messages_sync(&path).unwrap().len(), 2);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"role":"user","content":[{"type":"te"#).unwrap();
    drop(file);

    let h = Harness::open(h.dir, Options::default()).await;
    let restored = h.manager.get(id).unwrap();
    assert_eq!(restored.display_name(), "Bug hunt");
    assert_eq!(restored.resume_id().as_deref(), Some("up-9"));
    assert_eq!(restored.message_count(), 2);
    assert_eq!(restored.status(), SessionStatus::Idle);

    let created = h.manager.create("main", h.workdir()).await.unwrap();
    assert_eq!(created.display_name(), "Session 1");
}

#[tokio::test]
async fn test_get_or_create_default_is_stable() {
    let h = Harness::new().await;
    let first = h
        .manager
        .get_or_create_default("main", h.workdir())
        .await
        .unwrap();
    let second = h
        .manager
        .get_or_create_default("main", h.workdir())
        .await
        .unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(h.manager.list(Some("main")).len(), 1);
}
