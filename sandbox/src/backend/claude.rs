//! Claude backend: one `claude -p` invocation per round.
//!
//! New sessions are created client-side (a UUID passed via `--session-id`);
//! later rounds use `--resume`. Existence is checked against the CLI's
//! transcript store, `<projects_dir>/<project>/<session>.jsonl`.
//!
//! `--output-format stream-json` emits one JSON object per line:
//!
//! ```text
//! system    -> init, carries session_id
//! assistant -> message.content[] text/tool_use blocks (partial output)
//! result    -> final text, is_error, session_id
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{AgentBackend, BackendError, BackendReply, PartialFeed, PartialOutput};

const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ClaudeOptions {
    pub bin: String,
    pub workspace_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub model: Option<String>,
    /// Environment for the CLI process only.
    pub env: BTreeMap<String, String>,
}

pub struct ClaudeBackend {
    options: ClaudeOptions,
    partial_tx: Option<mpsc::UnboundedSender<PartialOutput>>,
    /// Sessions created here that have no transcript yet.
    fresh: Mutex<HashSet<String>>,
}

impl ClaudeBackend {
    pub fn new(options: ClaudeOptions) -> Self {
        Self {
            options,
            partial_tx: None,
            fresh: Mutex::new(HashSet::new()),
        }
    }

    fn is_fresh(&self, session_id: &str) -> bool {
        self.fresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    fn mark_persisted(&self, session_id: &str) {
        self.fresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    async fn transcript_exists(&self, session_id: &str) -> Result<bool, BackendError> {
        let file_name = format!("{session_id}.jsonl");
        let mut projects = match tokio::fs::read_dir(&self.options.projects_dir).await {
            Ok(projects) => projects,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        while let Some(project) = projects.next_entry().await? {
            if tokio::fs::try_exists(project.path().join(&file_name)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn start(&mut self) -> Result<PartialFeed, BackendError> {
        tokio::fs::create_dir_all(&self.options.workspace_dir).await?;
        let output = Command::new(&self.options.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Start(format!("spawn {}: {e}", self.options.bin)))?;
        if !output.status.success() {
            return Err(BackendError::Start(format!(
                "{} --version exited with {}",
                self.options.bin, output.status
            )));
        }
        info!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            model = ?self.options.model,
            "claude CLI available"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        self.partial_tx = Some(tx);
        Ok(rx)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError> {
        if uuid::Uuid::parse_str(session_id).is_err() {
            return Ok(false);
        }
        if self.is_fresh(session_id) {
            return Ok(true);
        }
        self.transcript_exists(session_id).await
    }

    async fn create_session(&self) -> Result<String, BackendError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.fresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        Ok(id)
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<BackendReply, BackendError> {
        let mut cmd = Command::new(&self.options.bin);
        cmd.arg("-p")
            .arg(text)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(model) = &self.options.model {
            cmd.arg("--model").arg(model);
        }
        if self.is_fresh(session_id) {
            cmd.arg("--session-id").arg(session_id);
        } else {
            cmd.arg("--resume").arg(session_id);
        }

        let mut child = cmd
            .current_dir(&self.options.workspace_dir)
            .envs(&self.options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Request(format!("spawn {}: {e}", self.options.bin)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&buf[start..]).into_owned()
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Request("claude stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut stream = StreamState::new(session_id);
        while let Some(line) = lines.next_line().await? {
            if let Some(partial) = stream.apply(&line) {
                if let Some(tx) = &self.partial_tx {
                    let _ = tx.send(partial);
                }
            }
        }

        let status = child.wait().await?;
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        debug!(%status, session_id, "claude round finished");

        let Some(result) = stream.result else {
            return Err(BackendError::Request(format!(
                "claude exited with {status} without a result: {}",
                stderr_tail.trim()
            )));
        };
        self.mark_persisted(session_id);

        if result.is_error {
            return Err(BackendError::Request(
                result
                    .text
                    .unwrap_or_else(|| "claude reported an error".to_string()),
            ));
        }
        Ok(BackendReply {
            text: result.text,
            session_id: stream
                .session_id
                .filter(|reported| reported.as_str() != session_id),
        })
    }

    async fn shutdown(&self) {
        // Each round's process exits on its own; nothing is held between rounds.
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamResult {
    text: Option<String>,
    is_error: bool,
}

#[derive(Debug)]
struct StreamState {
    requested_session: String,
    session_id: Option<String>,
    result: Option<StreamResult>,
}

impl StreamState {
    fn new(session_id: &str) -> Self {
        Self {
            requested_session: session_id.to_string(),
            session_id: None,
            result: None,
        }
    }

    /// Consume one stream-json line; returns partial output for assistant text.
    fn apply(&mut self, line: &str) -> Option<PartialOutput> {
        let event: Value = serde_json::from_str(line.trim()).ok()?;
        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(id.to_string());
        }

        match event.get("type").and_then(Value::as_str)? {
            "assistant" => {
                let blocks = event.pointer("/message/content")?.as_array()?;
                let text = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("");
                if text.is_empty() {
                    return None;
                }
                Some(PartialOutput {
                    session_id: self
                        .session_id
                        .clone()
                        .unwrap_or_else(|| self.requested_session.clone()),
                    text,
                })
            }
            "result" => {
                let text = match event.get("result") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                self.result = Some(StreamResult {
                    text,
                    is_error: event
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
                None
            }
            _ => None,
        }
    }
}
