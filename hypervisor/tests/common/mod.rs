//! Shared harness for orchestrator tests.
//!
//! `InProcessRuntime` stands in for the container engine: each "sandbox" is
//! a tokio task running the real worker loop against a scripted backend,
//! wired to the orchestrator through in-memory pipes and the mailbox
//! directory from the launch spec.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hypervisor::orchestrator::{Orchestrator, OrchestratorSettings, Reply, ReplySink};
use hypervisor::sandbox::{LaunchError, RuntimeError, SandboxRuntime, SandboxSpec, WorkerProcess};
use hypervisor::session_registry::SessionRegistry;
use sandbox::backend::ScriptedHandle;
use sandbox::{read_envelope, ExitReason, WorkerLoop};
use shared_types::{Envelope, Mailbox, RuntimeSelection, WorkerLimits};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);
const PIPE_BYTES: usize = 64 * 1024;

/// How the next launched sandbox behaves.
#[derive(Debug, Clone)]
pub enum SandboxMode {
    /// Real worker loop over the shared scripted backend.
    Worker,
    /// The engine refuses to start the instance.
    FailLaunch,
    /// Reads the envelope, prints a diagnostic, exits without a frame.
    Crash,
    /// Reads the envelope, prints these stdout lines verbatim, exits 0.
    Raw(Vec<String>),
    /// Like `Raw`, but stays up for a while afterwards without touching
    /// the mailbox.
    Linger(Duration, Vec<String>),
}

#[derive(Default)]
struct RuntimeState {
    mode: Option<SandboxMode>,
    running: HashMap<String, JoinHandle<()>>,
    preset: Vec<String>,
    launched: Vec<String>,
    stopped: Vec<String>,
    killed: Vec<String>,
    envelopes: Vec<Envelope>,
}

pub struct InProcessRuntime {
    backend: ScriptedHandle,
    state: Arc<Mutex<RuntimeState>>,
}

impl InProcessRuntime {
    pub fn new(backend: ScriptedHandle) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(RuntimeState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    /// Behavior for every launch from now on.
    pub fn set_mode(&self, mode: SandboxMode) {
        self.lock().mode = Some(mode);
    }

    /// Instances the engine reports as running without this runtime owning them.
    pub fn preset_running(&self, names: &[&str]) {
        self.lock().preset = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn launched(&self) -> Vec<String> {
        self.lock().launched.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.lock().envelopes.clone()
    }

    fn terminate(&self, name: &str) {
        let mut state = self.lock();
        state.preset.retain(|n| n != name);
        if let Some(task) = state.running.remove(name) {
            task.abort();
        }
    }
}

#[async_trait]
impl SandboxRuntime for InProcessRuntime {
    async fn launch(&self, spec: &SandboxSpec) -> Result<WorkerProcess, LaunchError> {
        let mode = self.lock().mode.clone().unwrap_or(SandboxMode::Worker);
        if matches!(mode, SandboxMode::FailLaunch) {
            return Err(LaunchError::ImageMissing(spec.image.clone()));
        }
        let mailbox_dir = spec
            .mailbox_dir()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| LaunchError::InvalidSpec("no mailbox mount".to_string()))?;

        let (host_stdin, sandbox_stdin) = tokio::io::duplex(PIPE_BYTES);
        let (sandbox_stdout, host_stdout) = tokio::io::duplex(PIPE_BYTES);
        let (sandbox_stderr, host_stderr) = tokio::io::duplex(PIPE_BYTES);
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();

        let backend = self.backend.clone();
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let code = run_sandbox(
                mode,
                sandbox_stdin,
                sandbox_stdout,
                sandbox_stderr,
                mailbox_dir,
                backend,
                state,
            )
            .await;
            let _ = exit_tx.send(Some(code));
        });

        {
            let mut state = self.lock();
            state.launched.push(spec.name.clone());
            state.running.insert(spec.name.clone(), task);
        }

        Ok(WorkerProcess {
            name: spec.name.clone(),
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            stderr: Box::new(host_stderr),
            // A dropped sender means the task was aborted: killed, no code.
            exited: Box::pin(async move { exit_rx.await.ok().flatten() }),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.lock().stopped.push(name.to_string());
        self.terminate(name);
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.lock().killed.push(name.to_string());
        self.terminate(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .preset
            .iter()
            .chain(
                state
                    .running
                    .iter()
                    .filter(|(_, task)| !task.is_finished())
                    .map(|(name, _)| name),
            )
            .filter(|n| n.starts_with(&format!("{prefix}-")))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

async fn run_sandbox(
    mode: SandboxMode,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    mailbox_dir: PathBuf,
    backend: ScriptedHandle,
    state: Arc<Mutex<RuntimeState>>,
) -> i32 {
    let envelope = match read_envelope(stdin).await {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = stderr.write_all(format!("bad envelope: {e}\n").as_bytes()).await;
            return 2;
        }
    };
    state.lock().unwrap().envelopes.push(envelope.clone());

    match mode {
        SandboxMode::Worker => {
            let worker = WorkerLoop::new(
                envelope,
                Box::new(backend.backend()),
                Mailbox::new(mailbox_dir),
                stdout,
            );
            match worker.run().await {
                Ok(exit) if exit.reason == ExitReason::StartFailed => 1,
                Ok(_) => 0,
                Err(_) => 1,
            }
        }
        SandboxMode::Crash => {
            let _ = stdout.write_all(b"fatal: backend exploded\n").await;
            let _ = stderr.write_all(b"panicked at worker.rs\n").await;
            137
        }
        SandboxMode::Raw(lines) => {
            for line in lines {
                let _ = stdout.write_all(format!("{line}\n").as_bytes()).await;
            }
            0
        }
        SandboxMode::Linger(wait, lines) => {
            for line in lines {
                let _ = stdout.write_all(format!("{line}\n").as_bytes()).await;
            }
            tokio::time::sleep(wait).await;
            0
        }
        SandboxMode::FailLaunch => 1,
    }
}

/// Collects delivered replies for assertions.
pub struct ReplyCollector {
    tx: mpsc::UnboundedSender<Reply>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Reply>>,
}

impl ReplyCollector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub async fn next(&self) -> Reply {
        tokio::time::timeout(WAIT, self.rx.lock().await.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed")
    }

    pub async fn assert_quiet(&self, window: Duration) {
        if let Ok(Some(reply)) = tokio::time::timeout(window, self.rx.lock().await.recv()).await {
            panic!("unexpected reply: {reply:?}");
        }
    }
}

#[async_trait]
impl ReplySink for ReplyCollector {
    async fn deliver(&self, reply: Reply) {
        let _ = self.tx.send(reply);
    }
}

pub fn settings(mailbox_root: PathBuf) -> OrchestratorSettings {
    OrchestratorSettings {
        image: "agent-sandbox:test".to_string(),
        name_prefix: "agent-sandbox".to_string(),
        mounts: Vec::new(),
        mailbox_root,
        worker_timeout: Duration::from_secs(20),
        grace: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(60),
        max_concurrent: 4,
        limits: WorkerLimits {
            round_timeout_ms: 10_000,
            poll_interval_ms: 10,
            round_timeout_terminates: true,
        },
        secrets: BTreeMap::from([("API_TOKEN".to_string(), "tok-1".to_string())]),
        default_runtime: RuntimeSelection::default(),
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub runtime: Arc<InProcessRuntime>,
    pub backend: ScriptedHandle,
    pub replies: Arc<ReplyCollector>,
    pub registry: SessionRegistry,
    pub mailbox_root: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(tweak: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mailbox_root = dir.path().join("mailboxes");
        let mut settings = settings(mailbox_root.clone());
        tweak(&mut settings);

        let backend = ScriptedHandle::default();
        let runtime = Arc::new(InProcessRuntime::new(backend.clone()));
        let replies = Arc::new(ReplyCollector::new());
        let pool = hypervisor::db::connect_in_memory().await.unwrap();
        let registry = SessionRegistry::new(pool);
        let orchestrator = Orchestrator::new(
            settings,
            runtime.clone(),
            registry.clone(),
            replies.clone(),
        );

        Self {
            orchestrator,
            runtime,
            backend,
            replies,
            registry,
            mailbox_root,
            _dir: dir,
        }
    }

    /// Wait until the conversation has no live worker.
    pub async fn wait_gone(&self, conversation_id: &shared_types::ConversationId) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.orchestrator.is_running(conversation_id).await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker for {conversation_id} did not exit"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
