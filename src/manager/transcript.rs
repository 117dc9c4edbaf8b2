//! Portable session snapshots.
//!
//! Schema 1 is a single JSON document. Schema 2 splits the messages into a
//! JSONL file next to a JSON sidecar holding everything else, which keeps
//! large exports streamable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionError, SessionResult};
use crate::store::write_atomic;
use crate::types::{Message, TranscriptStats};

pub const SCHEMA_MONOLITHIC: u32 = 1;
pub const SCHEMA_SPLIT: u32 = 2;

/// How much of each message an export keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportLevel {
    #[default]
    Full,
    /// Tool inputs and outputs replaced with empty placeholders.
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSource {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub level: ExportLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub schema: u32,
    pub exported_at: DateTime<Utc>,
    pub source: TranscriptSource,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stats: TranscriptStats,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    schema: u32,
    exported_at: DateTime<Utc>,
    source: TranscriptSource,
    #[serde(default)]
    stats: TranscriptStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    messages_file: Option<String>,
}

fn invalid(message: impl Into<String>) -> SessionError {
    SessionError::InvalidTranscript {
        message: message.into(),
    }
}

impl Transcript {
    pub fn new(source: TranscriptSource, messages: Vec<Message>) -> Self {
        let messages: Vec<Message> = match source.level {
            ExportLevel::Full => messages,
            ExportLevel::Summary => messages.iter().map(Message::redacted).collect(),
        };
        Self {
            schema: SCHEMA_MONOLITHIC,
            exported_at: Utc::now(),
            stats: TranscriptStats::from_messages(&messages),
            source,
            messages,
        }
    }

    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string_pretty(&Transcript {
            schema: SCHEMA_MONOLITHIC,
            ..self.clone()
        })?)
    }

    /// Parse a monolithic transcript.
    pub fn parse(json: &str) -> SessionResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| invalid(format!("not JSON: {}", e)))?;
        match schema_of(&value)? {
            SCHEMA_MONOLITHIC => {
                let transcript: Transcript = serde_json::from_value(value)
                    .map_err(|e| invalid(format!("malformed transcript: {}", e)))?;
                transcript.validated()
            }
            SCHEMA_SPLIT => Err(invalid(
                "schema 2 transcripts keep messages in a separate JSONL file",
            )),
            other => Err(invalid(format!("unsupported schema {}", other))),
        }
    }

    /// Parse a split transcript from its sidecar and JSONL contents.
    pub fn parse_split(sidecar: &str, jsonl: &str) -> SessionResult<Self> {
        let sidecar: Sidecar = serde_json::from_str(sidecar)
            .map_err(|e| invalid(format!("malformed sidecar: {}", e)))?;
        if sidecar.schema != SCHEMA_SPLIT {
            return Err(invalid(format!(
                "sidecar has schema {}, expected {}",
                sidecar.schema, SCHEMA_SPLIT
            )));
        }

        let mut messages = Vec::new();
        for (index, line) in jsonl.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = serde_json::from_str(line)
                .map_err(|e| invalid(format!("line {}: {}", index + 1, e)))?;
            messages.push(message);
        }

        Transcript {
            schema: SCHEMA_SPLIT,
            exported_at: sidecar.exported_at,
            source: sidecar.source,
            stats: TranscriptStats::from_messages(&messages),
            messages,
        }
        .validated()
    }

    /// Read either form from disk. A `.jsonl` path or a schema 2 sidecar
    /// resolves its partner file in the same directory.
    pub async fn read_path(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let is_jsonl = path.extension().is_some_and(|ext| ext == "jsonl");
        let sidecar_path = if is_jsonl {
            path.with_extension("json")
        } else {
            path.to_path_buf()
        };

        let sidecar = tokio::fs::read_to_string(&sidecar_path).await?;
        if !is_jsonl {
            let value: serde_json::Value =
                serde_json::from_str(&sidecar).map_err(|e| invalid(format!("not JSON: {}", e)))?;
            if schema_of(&value)? != SCHEMA_SPLIT {
                return Self::parse(&sidecar);
            }
        }

        let messages_path = if is_jsonl {
            path.to_path_buf()
        } else {
            let named = serde_json::from_str::<Sidecar>(&sidecar)
                .ok()
                .and_then(|s| s.messages_file);
            match named {
                Some(name) => sidecar_path.with_file_name(name),
                None => sidecar_path.with_extension("jsonl"),
            }
        };
        let jsonl = tokio::fs::read_to_string(&messages_path).await?;
        Self::parse_split(&sidecar, &jsonl)
    }

    /// Write `<stem>.jsonl` and `<stem>.json` into `dir`.
    pub async fn write_split(&self, dir: impl AsRef<Path>, stem: &str) -> SessionResult<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        let jsonl_path = dir.join(format!("{}.jsonl", stem));
        let sidecar_path = dir.join(format!("{}.json", stem));

        let mut jsonl = Vec::new();
        for message in &self.messages {
            serde_json::to_writer(&mut jsonl, message)?;
            jsonl.push(b'\n');
        }
        let sidecar = serde_json::to_vec_pretty(&Sidecar {
            schema: SCHEMA_SPLIT,
            exported_at: self.exported_at,
            source: self.source.clone(),
            stats: self.stats,
            messages_file: Some(format!("{}.jsonl", stem)),
        })?;

        write_atomic(jsonl_path.clone(), jsonl, false).await?;
        write_atomic(sidecar_path.clone(), sidecar, false).await?;
        Ok((jsonl_path, sidecar_path))
    }

    fn validated(self) -> SessionResult<Self> {
        if self.messages.is_empty() {
            return Err(invalid("transcript has no messages"));
        }
        Ok(self)
    }
}

fn schema_of(value: &serde_json::Value) -> SessionResult<u32> {
    value
        .get("schema")
        .and_then(|s| s.as_u64())
        .and_then(|s| u32::try_from(s).ok())
        .ok_or_else(|| invalid("missing schema"))
}
