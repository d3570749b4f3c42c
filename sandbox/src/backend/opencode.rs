//! Opencode backend: an `opencode serve` HTTP session server running next to
//! the worker inside the sandbox.
//!
//! - `GET  /session/{id}`          existence check
//! - `POST /session`               create
//! - `POST /session/{id}/message`  blocking prompt round-trip
//! - `GET  /event`                 SSE feed; assistant text parts are the partial output

use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{AgentBackend, BackendError, BackendReply, PartialFeed, PartialOutput};

const HEALTH_ATTEMPTS: usize = 40;
const HEALTH_DELAY_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct OpencodeOptions {
    pub bin: String,
    pub workspace_dir: PathBuf,
    pub config_dir: PathBuf,
    pub provider: String,
    pub model: String,
    pub credential: Option<String>,
    pub secrets: BTreeMap<String, String>,
}

pub struct OpencodeBackend {
    options: OpencodeOptions,
    http: Client,
    base_url: Option<String>,
    child: Mutex<Option<Child>>,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl OpencodeBackend {
    pub fn new(options: OpencodeOptions) -> Self {
        Self {
            options,
            http: Client::new(),
            base_url: None,
            child: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    fn base_url(&self) -> Result<&str, BackendError> {
        self.base_url
            .as_deref()
            .ok_or_else(|| BackendError::Request("opencode server not started".to_string()))
    }

    async fn write_config(&self) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(&self.options.config_dir).await?;
        let path = self.options.config_dir.join("opencode.json");
        let config = build_config(&self.options);
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| BackendError::Start(format!("encode opencode config: {e}")))?;
        tokio::fs::write(&path, body).await?;
        info!(path = %path.display(), model = %self.options.model, "wrote opencode config");
        Ok(path)
    }

    async fn wait_for_server(&self, base_url: &str) -> Result<(), BackendError> {
        for _ in 0..HEALTH_ATTEMPTS {
            if let Some(child) = self.child.lock().await.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(BackendError::Start(format!(
                        "opencode server exited during startup: {status}"
                    )));
                }
            }
            match self.http.get(format!("{base_url}/config")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(_) | Err(_) => {}
            }
            sleep(Duration::from_millis(HEALTH_DELAY_MS)).await;
        }
        Err(BackendError::Start(
            "opencode server health check failed".to_string(),
        ))
    }
}

#[async_trait]
impl AgentBackend for OpencodeBackend {
    fn name(&self) -> &'static str {
        "opencode"
    }

    async fn start(&mut self) -> Result<PartialFeed, BackendError> {
        let config_path = self.write_config().await?;
        let port = find_available_port()?;
        let base_url = format!("http://127.0.0.1:{port}");

        let child = Command::new(&self.options.bin)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .arg("--hostname")
            .arg("127.0.0.1")
            .current_dir(&self.options.workspace_dir)
            .env("OPENCODE_CONFIG", &config_path)
            .envs(&self.options.secrets)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Start(format!("spawn {}: {e}", self.options.bin)))?;
        *self.child.lock().await = Some(child);

        self.wait_for_server(&base_url).await?;
        info!(%base_url, "opencode server ready");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(stream_events(self.http.clone(), base_url.clone(), tx));
        *self.events.lock().await = Some(task);
        self.base_url = Some(base_url);
        Ok(rx)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError> {
        let base_url = self.base_url()?;
        let response = self
            .http
            .get(format!("{base_url}/session/{session_id}"))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BackendError::Request(format!(
                "session lookup returned {status}"
            ))),
        }
    }

    async fn create_session(&self) -> Result<String, BackendError> {
        let base_url = self.base_url()?;
        let body: Value = self
            .http
            .post(format!("{base_url}/session"))
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| BackendError::Malformed(format!("session without id: {body}")))
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<BackendReply, BackendError> {
        let base_url = self.base_url()?;
        let body: Value = self
            .http
            .post(format!("{base_url}/session/{session_id}/message"))
            .json(&json!({
                "parts": [{ "type": "text", "text": text }],
                "model": {
                    "providerID": self.options.provider,
                    "modelID": self.options.model,
                },
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_message_reply(&body)
    }

    async fn shutdown(&self) {
        if let Some(task) = self.events.lock().await.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill opencode server");
            }
        }
    }
}

fn build_config(options: &OpencodeOptions) -> Value {
    let mut config = json!({
        "$schema": "https://opencode.ai/config.json",
        "model": format!("{}/{}", options.provider, options.model),
        "autoupdate": false,
    });
    if let Some(credential) = &options.credential {
        let mut providers = serde_json::Map::new();
        providers.insert(
            options.provider.clone(),
            json!({ "options": { "apiKey": format!("{{env:{credential}}}") } }),
        );
        config["provider"] = Value::Object(providers);
    }
    config
}

fn find_available_port() -> Result<u16, BackendError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn parse_message_reply(body: &Value) -> Result<BackendReply, BackendError> {
    if let Some(error) = body.pointer("/info/error") {
        let message = error
            .pointer("/data/message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(BackendError::Request(message));
    }

    let parts = body
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Malformed(format!("reply without parts: {body}")))?;
    let text = parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter(|part| part.get("synthetic").and_then(Value::as_bool) != Some(true))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(BackendReply {
        text: Some(text),
        session_id: None,
    })
}

/// Tracks which message ids belong to the assistant so echoed user parts
/// never count as output.
#[derive(Debug, Default)]
struct EventFilter {
    assistant_messages: HashSet<String>,
}

impl EventFilter {
    fn apply(&mut self, event: &Value) -> Option<PartialOutput> {
        let kind = event.get("type").and_then(Value::as_str)?;
        let props = event.get("properties")?;
        match kind {
            "message.updated" => {
                let info = props.get("info")?;
                if info.get("role").and_then(Value::as_str) == Some("assistant") {
                    let id = info.get("id").and_then(Value::as_str)?;
                    self.assistant_messages.insert(id.to_string());
                }
                None
            }
            "message.part.updated" => {
                let part = props.get("part")?;
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    return None;
                }
                let message_id = part.get("messageID").and_then(Value::as_str)?;
                if !self.assistant_messages.contains(message_id) {
                    return None;
                }
                Some(PartialOutput {
                    session_id: part.get("sessionID").and_then(Value::as_str)?.to_string(),
                    text: part.get("text").and_then(Value::as_str)?.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Splits a byte stream into lines. Only complete lines are decoded, so a
/// multi-byte character split across chunks stays intact.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }
}

async fn stream_events(
    http: Client,
    base_url: String,
    tx: mpsc::UnboundedSender<PartialOutput>,
) {
    let response = match http.get(format!("{base_url}/event")).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "opencode event feed unavailable; continuing without partial output");
            return;
        }
    };

    let mut filter = EventFilter::default();
    let mut stream = response.bytes_stream();
    let mut buf = LineBuffer::default();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "opencode event feed closed");
                return;
            }
        };
        for line in buf.push(&chunk) {
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if let Some(partial) = filter.apply(&event) {
                if tx.send(partial).is_err() {
                    return;
                }
            }
        }
    }
}
