//! Container-CLI runtime (`docker` or a CLI-compatible `podman`).
//!
//! `run -i --rm` keeps stdin attached for the envelope; the container is
//! removed by the engine once it stops, so `stop` doubles as cleanup.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{LaunchError, RuntimeError, SandboxRuntime, SandboxSpec, WorkerProcess};

const LABEL: &str = "agent-sandbox.managed=true";

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    cli: String,
    stop_grace: Duration,
}

impl DockerRuntime {
    pub fn new(cli: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            cli: cli.into(),
            stop_grace,
        }
    }

    async fn run_cli(&self, args: &[String]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(RuntimeError::Command(format!(
            "{} {} exited with {}: {}",
            self.cli,
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn image_present(&self, image: &str) -> bool {
        let args = vec!["image".to_string(), "inspect".to_string(), image.to_string()];
        self.run_cli(&args).await.is_ok()
    }
}

/// Arguments for `<cli> run`, image last.
fn run_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--label".to_string(),
        LABEL.to_string(),
    ];
    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.sandbox.display());
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }
    args.push(spec.image.clone());
    args
}

fn is_absent(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::Command(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("no such container") || msg.contains("is not running")
        }
        RuntimeError::Io(_) => false,
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn launch(&self, spec: &SandboxSpec) -> Result<WorkerProcess, LaunchError> {
        if !self.image_present(&spec.image).await {
            return Err(LaunchError::ImageMissing(spec.image.clone()));
        }

        let mut child = Command::new(&self.cli)
            .args(run_args(spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::Start {
                name: spec.name.clone(),
                reason: format!("spawn {}: {e}", self.cli),
            })?;

        let missing = |stream: &str| LaunchError::Start {
            name: spec.name.clone(),
            reason: format!("{stream} not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let name = spec.name.clone();
        let exited = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(instance = %name, error = %e, "failed to wait on sandbox client");
                    None
                }
            }
        });

        Ok(WorkerProcess {
            name: spec.name.clone(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exited,
        })
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.stop_grace.as_secs().to_string(),
            name.to_string(),
        ];
        match self.run_cli(&args).await {
            Ok(_) => {
                debug!(instance = name, "sandbox stop sent");
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["kill".to_string(), name.to_string()];
        match self.run_cli(&args).await {
            Ok(_) => {
                debug!(instance = name, "sandbox killed");
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let out = self.run_cli(&list_args(prefix)).await?;
        Ok(owned_names(&out, prefix))
    }
}

/// Only containers we labelled, named like ours.
fn list_args(prefix: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("label={LABEL}"),
        "--filter".to_string(),
        format!("name={prefix}-"),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ]
}

/// The engine's name filter is a substring match; keep exact `{prefix}-` heads.
fn owned_names(output: &str, prefix: &str) -> Vec<String> {
    let head = format!("{prefix}-");
    output
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(&head))
        .map(ToString::to_string)
        .collect()
}
