//! Agent backends the worker can drive.
//!
//! The worker only needs four capabilities from a backend: check that a
//! session exists, create one, submit a prompt and await the structured
//! reply, and a best-effort feed of partial output. Which backend runs is
//! decided once from the envelope's [`RuntimeSelection`].

pub mod claude;
pub mod opencode;
pub mod scripted;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use shared_types::{Envelope, RuntimeSelection};
use tokio::sync::mpsc;

pub use claude::{ClaudeBackend, ClaudeOptions};
pub use opencode::{OpencodeBackend, OpencodeOptions};
pub use scripted::{ScriptedBackend, ScriptedHandle, ScriptedReply};

/// Partial output notification. `text` is cumulative for the message it
/// belongs to, so consumers overwrite rather than append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialOutput {
    pub session_id: String,
    pub text: String,
}

pub type PartialFeed = mpsc::UnboundedReceiver<PartialOutput>;

/// Reply to one submitted prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendReply {
    /// `None` or empty when the backend assembled no final content.
    pub text: Option<String>,
    /// Set when the backend reports a session id different from the one used.
    pub session_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start backend: {0}")]
    Start(String),
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend returned a malformed reply: {0}")]
    Malformed(String),
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Request(e.to_string())
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write any configuration the backend needs, start its client, and
    /// return the partial-output feed.
    async fn start(&mut self) -> Result<PartialFeed, BackendError>;

    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError>;

    async fn create_session(&self) -> Result<String, BackendError>;

    async fn prompt(&self, session_id: &str, text: &str) -> Result<BackendReply, BackendError>;

    /// Release the client and any process it owns. Must be safe to call twice.
    async fn shutdown(&self);
}

/// Paths and binaries the backends run with inside the sandbox.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Working directory the agent operates in.
    pub workspace_dir: PathBuf,
    /// Where backend configuration files are written.
    pub config_dir: PathBuf,
    pub opencode_bin: String,
    pub claude_bin: String,
    /// Transcript store of the `claude` CLI (`~/.claude/projects`).
    pub claude_projects_dir: PathBuf,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("/workspace/group"),
            config_dir: PathBuf::from("/home/sandbox/.config/opencode"),
            opencode_bin: "opencode".to_string(),
            claude_bin: "claude".to_string(),
            claude_projects_dir: PathBuf::from("/home/sandbox/.claude/projects"),
        }
    }
}

/// Pick the backend for this worker's lifetime.
pub fn build_backend(envelope: &Envelope, options: &BackendOptions) -> Box<dyn AgentBackend> {
    let secrets = envelope.secrets.clone();
    match &envelope.runtime {
        RuntimeSelection::Opencode {
            provider,
            model,
            credential,
        } => Box::new(OpencodeBackend::new(OpencodeOptions {
            bin: options.opencode_bin.clone(),
            workspace_dir: options.workspace_dir.clone(),
            config_dir: options.config_dir.clone(),
            provider: provider.clone(),
            model: model.clone(),
            credential: credential.clone(),
            secrets,
        })),
        RuntimeSelection::Claude { model, credential } => {
            Box::new(ClaudeBackend::new(ClaudeOptions {
                bin: options.claude_bin.clone(),
                workspace_dir: options.workspace_dir.clone(),
                projects_dir: options.claude_projects_dir.clone(),
                model: model.clone(),
                env: claude_env(credential.as_deref(), secrets),
            }))
        }
    }
}

/// Secrets become the child process environment; the named credential is
/// additionally exposed under the variable the CLI reads.
fn claude_env(
    credential: Option<&str>,
    mut secrets: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    if let Some(value) = credential.and_then(|name| secrets.get(name).cloned()) {
        secrets
            .entry("ANTHROPIC_API_KEY".to_string())
            .or_insert(value);
    }
    secrets
}
