//! Export and import through transcripts.

mod common;

use agent_engine::manager::{SCHEMA_SPLIT, TranscriptSource};
use agent_engine::{ContentBlock, ExportLevel, Message, ResumeWriter, SessionError, Transcript};
use common::*;

async fn session_with_tool_turn(h: &mut Harness) -> std::sync::Arc<agent_engine::Session> {
    let session = h.manager.create("main", h.workdir()).await.unwrap();
    let mut sub = session.subscribe();
    session.send("what is in here?").await.unwrap();
    let mut agent = h.next_agent().await;
    agent.read_json().await;
    agent.emit(init("up-1")).await;
    agent
        .emit_all(tool_use_block("up-1", 0, "tu_1", "Bash", &[r#"{"command":"ls"}"#]))
        .await;
    agent.emit(tool_result("up-1", "tu_1", "Cargo.toml\nsrc")).await;
    agent.emit_all(text_block("up-1", 1, &["A Rust crate."])).await;
    agent.emit(result("up-1")).await;
    collect_turn(&mut sub).await;
    session
}

#[tokio::test]
async fn test_export_import_monolithic() {
    let mut h = Harness::new().await;
    let source = session_with_tool_turn(&mut h).await;

    let exported = h.manager.export(source.id(), ExportLevel::Full).unwrap();
    assert_eq!(exported.schema, 1);
    assert_eq!(exported.stats.message_count, 2);
    assert_eq!(exported.stats.tool_uses, 1);
    assert_eq!(exported.source.worktree, "main");

    let parsed = Transcript::parse(&exported.to_json().unwrap()).unwrap();
    let imported = h.manager.import(&parsed, "feature", h.workdir()).await.unwrap();

    assert_ne!(imported.id(), source.id());
    assert_eq!(imported.worktree(), "feature");
    assert_eq!(imported.messages(), source.messages());
    let resume_id = imported.resume_id().unwrap();

    // The conversation file splits the tool result into its own user entry.
    let conversation = ResumeWriter::new(h.agent_home()).conversation_path(&h.workdir(), &resume_id);
    let entries: Vec<serde_json::Value> = std::fs::read_to_string(&conversation)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let types: Vec<&str> = entries.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["user", "assistant", "user", "assistant"]);
    assert_eq!(entries[1]["parentUuid"], entries[0]["uuid"]);
    assert_eq!(entries[2]["message"]["content"][0]["type"], "tool_result");

    let index = conversation.with_file_name("sessions-index.json");
    let index: serde_json::Value = serde_json::from_slice(&std::fs::read(index).unwrap()).unwrap();
    assert_eq!(index["entries"][0]["sessionId"], resume_id.as_str());

    // First send on the imported session resumes that conversation.
    imported.send("continue").await.unwrap();
    let mut agent = h.next_agent().await;
    assert_eq!(agent.spec.resume_id.as_deref(), Some(resume_id.as_str()));
    agent.read_json().await;
}

#[tokio::test]
async fn test_export_import_split_files() {
    let mut h = Harness::new().await;
    let source = session_with_tool_turn(&mut h).await;
    let exported = h.manager.export(source.id(), ExportLevel::Full).unwrap();

    let export_dir = h.dir.path().join("exports");
    std::fs::create_dir_all(&export_dir).unwrap();
    let (jsonl, sidecar) = exported.write_split(&export_dir, "bug-hunt").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&jsonl).unwrap().lines().count(),
        2
    );

    let read_back = Transcript::read_path(&sidecar).await.unwrap();
    assert_eq!(read_back.schema, SCHEMA_SPLIT);
    assert_eq!(read_back.messages, exported.messages);

    let imported = h.manager.import(&read_back, "main", h.workdir()).await.unwrap();
    assert_eq!(imported.message_count(), 2);
    assert_eq!(imported.display_name(), source.display_name());
    assert_eq!(h.manager.list(Some("main")).len(), 2);
}

#[tokio::test]
async fn test_summary_export_redacts_tools() {
    let mut h = Harness::new().await;
    let source = session_with_tool_turn(&mut h).await;

    let summary = h.manager.export(source.id(), ExportLevel::Summary).unwrap();
    assert_eq!(summary.source.level, ExportLevel::Summary);
    let reply = &summary.messages[1];
    let tool_use = reply.content[0].as_tool_use().unwrap();
    assert_eq!(tool_use.name, "Bash");
    assert_eq!(tool_use.input, serde_json::json!({}));
    match &reply.content[1] {
        ContentBlock::ToolResult(result) => assert!(result.content.is_none()),
        other => panic!("expected tool result, got {:?}", other),
    }
    assert_eq!(reply.text(), "A Rust crate.");

    // The live session is untouched.
    let live = source.messages();
    assert_eq!(live[1].content[0].as_tool_use().unwrap().input["command"], "ls");
}

#[tokio::test]
async fn test_import_rejects_bad_transcripts() {
    let h = Harness::new().await;

    let empty = Transcript::new(
        TranscriptSource {
            session_id: None,
            display_name: "empty".into(),
            worktree: "main".into(),
            working_dir: None,
            level: ExportLevel::Full,
        },
        Vec::new(),
    );
    assert!(matches!(
        h.manager.import(&empty, "main", h.workdir()).await,
        Err(SessionError::InvalidTranscript { .. })
    ));

    let mut future = Transcript::new(empty.source.clone(), vec![Message::user("hi")]);
    future.schema = 3;
    assert!(matches!(
        h.manager.import(&future, "main", h.workdir()).await,
        Err(SessionError::InvalidTranscript { .. })
    ));

    assert!(Transcript::parse(r#"{"schema": 3, "messages": []}"#).is_err());
    assert!(h.manager.list(None).is_empty());
}

#[tokio::test]
async fn test_import_without_name_gets_ordinal() {
    let h = Harness::new().await;
    h.manager.create("main", h.workdir()).await.unwrap();
    let transcript = Transcript::new(
        TranscriptSource {
            session_id: None,
            display_name: String::new(),
            worktree: String::new(),
            working_dir: None,
            level: ExportLevel::Full,
        },
        vec![
            Message::user("hi"),
            Message::assistant(vec![ContentBlock::text("hello")]),
        ],
    );
    let imported = h.manager.import(&transcript, "main", h.workdir()).await.unwrap();
    assert_eq!(imported.display_name(), "Session 2");
}
