use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sandbox::worker::WorkerLoop;
use sandbox::{build_backend, read_envelope, BackendOptions, ExitReason};
use shared_types::{write_frame, Mailbox, ResultFrame};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Agent worker. Reads the task envelope from stdin; stdout carries only
/// result frames.
#[derive(Parser, Debug)]
#[command(name = "sandbox", version)]
struct WorkerArgs {
    /// Mailbox directory for follow-up messages and the close sentinel.
    #[arg(long, env = "SANDBOX_MAILBOX_DIR", default_value = "/workspace/ipc/input")]
    mailbox: PathBuf,

    /// Directory the agent works in.
    #[arg(long, env = "SANDBOX_WORKSPACE_DIR", default_value = "/workspace/group")]
    workspace: PathBuf,

    #[arg(long, env = "SANDBOX_BACKEND_CONFIG_DIR", default_value = "/home/sandbox/.config/opencode")]
    config_dir: PathBuf,

    #[arg(long, env = "SANDBOX_OPENCODE_BIN", default_value = "opencode")]
    opencode_bin: String,

    #[arg(long, env = "SANDBOX_CLAUDE_BIN", default_value = "claude")]
    claude_bin: String,

    #[arg(long, env = "SANDBOX_CLAUDE_PROJECTS_DIR", default_value = "/home/sandbox/.claude/projects")]
    claude_projects_dir: PathBuf,
}

impl WorkerArgs {
    fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            workspace_dir: self.workspace.clone(),
            config_dir: self.config_dir.clone(),
            opencode_bin: self.opencode_bin.clone(),
            claude_bin: self.claude_bin.clone(),
            claude_projects_dir: self.claude_projects_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout is the frame channel; everything else goes to stderr.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox=info,shared_types=info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let args = WorkerArgs::parse();
    let mut stdout = tokio::io::stdout();

    let envelope = match read_envelope(tokio::io::stdin()).await {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(error = %e, "could not read task envelope");
            let frame = ResultFrame::failure(e.to_string(), None).with_inputs(1);
            if let Err(write_err) = write_frame(&mut stdout, &frame).await {
                tracing::error!(error = %write_err, "could not report envelope failure");
            }
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?envelope, mailbox = %args.mailbox.display(), "envelope received");

    let backend = build_backend(&envelope, &args.backend_options());
    let mailbox = Mailbox::new(&args.mailbox);

    match WorkerLoop::new(envelope, backend, mailbox, stdout).run().await {
        Ok(exit) if exit.reason == ExitReason::StartFailed => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}
