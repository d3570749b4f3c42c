//! Worker Launcher: sandbox specs, instance naming, and the runtime seam.
//!
//! The orchestrator only ever sees an instance name and the process's
//! stdio; the [`SandboxSpec`] stays here.

pub mod docker;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use shared_types::ConversationId;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

pub use docker::DockerRuntime;

/// Where the conversation mailbox appears inside the sandbox.
pub const MAILBOX_MOUNT: &str = "/workspace/ipc/input";

const NAME_SLUG_MAX: usize = 24;

// ============================================================================
// Spec
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub sandbox: PathBuf,
    pub read_only: bool,
}

impl FromStr for Mount {
    type Err = LaunchError;

    /// `host:sandbox` or `host:sandbox:ro`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(':').collect();
        let (host, sandbox, read_only) = match parts.as_slice() {
            [host, sandbox] => (host, sandbox, false),
            [host, sandbox, "ro"] => (host, sandbox, true),
            [host, sandbox, "rw"] => (host, sandbox, false),
            _ => {
                return Err(LaunchError::InvalidSpec(format!(
                    "mount '{raw}' is not host:sandbox[:ro]"
                )))
            }
        };
        if host.is_empty() || sandbox.is_empty() || !sandbox.starts_with('/') {
            return Err(LaunchError::InvalidSpec(format!(
                "mount '{raw}' needs a host path and an absolute sandbox path"
            )));
        }
        Ok(Self {
            host: PathBuf::from(host),
            sandbox: PathBuf::from(sandbox),
            read_only,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub image: String,
    pub name: String,
    pub mounts: Vec<Mount>,
    pub timeout: Duration,
}

impl SandboxSpec {
    /// Host side of the mailbox mount.
    pub fn mailbox_dir(&self) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.sandbox == Path::new(MAILBOX_MOUNT))
            .map(|m| m.host.as_path())
    }
}

// ============================================================================
// Runtime seam
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid sandbox spec: {0}")]
    InvalidSpec(String),
    #[error("sandbox image {0} is not available")]
    ImageMissing(String),
    #[error("failed to start sandbox {name}: {reason}")]
    Start { name: String, reason: String },
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("sandbox runtime command failed: {0}")]
    Command(String),
    #[error("sandbox runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started worker. `exited` resolves with the exit code once the process
/// is gone (`None` when killed or unknown).
pub struct WorkerProcess {
    pub name: String,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub exited: BoxFuture<'static, Option<i32>>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    /// Start the instance with stdin open for writing and stdout for reading.
    async fn launch(&self, spec: &SandboxSpec) -> Result<WorkerProcess, LaunchError>;

    /// Ask the instance to stop. Stopping an absent instance is not an error.
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-terminate. Killing an absent instance is not an error.
    async fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    /// Running instances whose names start with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError>;
}

// ============================================================================
// Launcher
// ============================================================================

pub struct WorkerLauncher {
    runtime: Arc<dyn SandboxRuntime>,
    image: String,
    name_prefix: String,
    mounts: Vec<Mount>,
    timeout: Duration,
}

impl WorkerLauncher {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        image: String,
        name_prefix: String,
        mounts: Vec<Mount>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            image,
            name_prefix,
            mounts,
            timeout,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// `<prefix>-<conversation slug>-<ulid>`; the ULID keeps names unique
    /// across concurrent and orphaned instances.
    pub fn instance_name(&self, conversation: &ConversationId) -> String {
        let slug = name_slug(conversation.as_str());
        let id = ulid::Ulid::new().to_string().to_lowercase();
        if slug.is_empty() {
            format!("{}-{id}", self.name_prefix)
        } else {
            format!("{}-{slug}-{id}", self.name_prefix)
        }
    }

    pub fn spec(&self, conversation: &ConversationId, mailbox_dir: &Path) -> SandboxSpec {
        let mut mounts = self.mounts.clone();
        mounts.push(Mount {
            host: mailbox_dir.to_path_buf(),
            sandbox: PathBuf::from(MAILBOX_MOUNT),
            read_only: false,
        });
        SandboxSpec {
            image: self.image.clone(),
            name: self.instance_name(conversation),
            mounts,
            timeout: self.timeout,
        }
    }

    pub async fn launch(
        &self,
        conversation: &ConversationId,
        mailbox_dir: &Path,
    ) -> Result<WorkerProcess, LaunchError> {
        let spec = self.spec(conversation, mailbox_dir);
        if spec.image.is_empty() {
            return Err(LaunchError::InvalidSpec("no image configured".to_string()));
        }
        for mount in &spec.mounts {
            if !tokio::fs::try_exists(&mount.host).await? {
                return Err(LaunchError::InvalidSpec(format!(
                    "mount source {} does not exist",
                    mount.host.display()
                )));
            }
        }

        let process = self.runtime.launch(&spec).await?;
        info!(
            %conversation,
            instance = %spec.name,
            image = %spec.image,
            mounts = spec.mounts.len(),
            "sandbox launched"
        );
        Ok(process)
    }
}

fn name_slug(raw: &str) -> String {
    let mut slug = String::new();
    for c in raw.chars() {
        if slug.len() >= NAME_SLUG_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Filesystem-safe, injective encoding of a conversation id.
pub fn mailbox_dir_name(conversation: &ConversationId) -> String {
    let mut out = String::new();
    for b in conversation.as_str().bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "_2e");
    }
    out
}
