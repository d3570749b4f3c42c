//! Orchestrator: one worker per active conversation.
//!
//! Per conversation turn:
//! - no live worker: reset the mailbox, read the session registry, launch a
//!   worker, write the envelope once and close its stdin
//! - live worker: publish the turn into the worker's mailbox
//!
//! A supervising task per worker reads framed results off stdout, records
//! each frame's session id, forwards outcomes to the [`ReplySink`], and runs
//! the close / stop / kill escalation. The whole-lifetime timeout skips the
//! graceful step.
//!
//! Every input sent to a worker is counted until a frame answers it. When a
//! worker goes away, inputs it consumed without answering get an error
//! outcome and messages it never drained are relaunched as a fresh turn.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{
    ConversationId, Envelope, FrameParser, Mailbox, MailboxError, ParsedLine, ResultFrame,
    RuntimeSelection, WorkerLimits,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex, Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::sandbox::{
    mailbox_dir_name, LaunchError, Mount, SandboxRuntime, WorkerLauncher, WorkerProcess,
};
use crate::session_registry::{RegistryError, SessionRegistry};

/// Non-framed worker output kept for error reports.
pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

const EXIT_DETAIL_LINES: usize = 5;

// ============================================================================
// Settings & public types
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub image: String,
    pub name_prefix: String,
    pub mounts: Vec<Mount>,
    pub mailbox_root: PathBuf,
    pub worker_timeout: Duration,
    pub grace: Duration,
    pub idle_timeout: Duration,
    pub max_concurrent: usize,
    pub limits: WorkerLimits,
    pub secrets: BTreeMap<String, String>,
    pub default_runtime: RuntimeSelection,
}

/// One inbound turn for a conversation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Turn {
    pub prompt: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_scheduled: bool,
}

impl Turn {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Dispatch {
    Launched { instance: String },
    Queued,
}

/// Final outcome the caller sees for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { text: String },
    Error { message: String },
    Timeout { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Reply {
    pub fn new(conversation_id: ConversationId, outcome: Outcome, session_id: Option<String>) -> Self {
        Self {
            conversation_id,
            outcome,
            session_id,
            at: Utc::now(),
        }
    }
}

/// Where final outcomes go (chat adapter, HTTP outbox, test collector).
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn deliver(&self, reply: Reply);
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("worker launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("worker {instance} timed out after {after_secs}s")]
    Timeout { instance: String, after_secs: u64 },
    #[error("worker {instance} exited (code {code:?}) without replying: {detail}")]
    WorkerExited {
        instance: String,
        code: Option<i32>,
        detail: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub conversation_id: ConversationId,
    /// `None` while the sandbox is still being launched.
    pub instance: Option<String>,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub awaiting_reply: bool,
    pub pending_inputs: u32,
    pub closing: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

struct WorkerEntry {
    instance: Option<String>,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    /// Inputs sent (envelope plus mailbox messages) that no frame has
    /// answered yet.
    pending_inputs: u32,
    /// Close sentinel written or lifetime expired; no more input goes in.
    closing: bool,
    /// Serializes this conversation's mailbox I/O. The `workers` map lock
    /// is never held across it.
    gate: Arc<Mutex<()>>,
    close_signal: Arc<Notify>,
    done: watch::Receiver<bool>,
}

impl WorkerEntry {
    fn owns(&self, gate: &Arc<Mutex<()>>) -> bool {
        Arc::ptr_eq(&self.gate, gate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Idle,
    AwaitExit,
    AwaitStop,
    Killed,
}

enum Route {
    Queue(Arc<Mutex<()>>),
    Launch {
        gate: Arc<Mutex<()>>,
        io: OwnedMutexGuard<()>,
        close_signal: Arc<Notify>,
        done_tx: watch::Sender<bool>,
    },
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    launcher: WorkerLauncher,
    registry: SessionRegistry,
    sink: Arc<dyn ReplySink>,
    /// conversation → live worker
    workers: Mutex<HashMap<ConversationId, WorkerEntry>>,
    slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        runtime: Arc<dyn SandboxRuntime>,
        registry: SessionRegistry,
        sink: Arc<dyn ReplySink>,
    ) -> Arc<Self> {
        let launcher = WorkerLauncher::new(
            runtime,
            settings.image.clone(),
            settings.name_prefix.clone(),
            settings.mounts.clone(),
            settings.worker_timeout,
        );
        let slots = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Arc::new(Self {
            settings,
            launcher,
            registry,
            sink,
            workers: Mutex::new(HashMap::new()),
            slots,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn mailbox(&self, conversation_id: &ConversationId) -> Mailbox {
        Mailbox::new(
            self.settings
                .mailbox_root
                .join(mailbox_dir_name(conversation_id)),
        )
    }

    /// Launch a worker for the turn, or queue it into the live worker's mailbox.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        turn: Turn,
    ) -> Result<Dispatch, OrchestratorError> {
        let mailbox = self.mailbox(conversation_id);

        loop {
            match self.route(conversation_id).await {
                Route::Queue(gate) => {
                    let _io = gate.lock().await;
                    if !self.count_input(conversation_id, &gate, 1).await {
                        // Closed or replaced while we waited for the gate.
                        continue;
                    }
                    if let Err(e) = mailbox.publish(&turn.prompt).await {
                        self.uncount_input(conversation_id, &gate).await;
                        return Err(e.into());
                    }
                    debug!(%conversation_id, "follow-up queued in mailbox");
                    return Ok(Dispatch::Queued);
                }
                Route::Launch {
                    gate,
                    io,
                    close_signal,
                    done_tx,
                } => {
                    let discarded = match mailbox.reset().await {
                        Ok(discarded) => discarded,
                        Err(e) => {
                            self.workers.lock().await.remove(conversation_id);
                            let _ = done_tx.send(true);
                            return Err(e.into());
                        }
                    };
                    drop(io);
                    if discarded > 0 {
                        warn!(%conversation_id, discarded, "discarded stale mailbox messages");
                    }
                    return self
                        .start_worker(conversation_id, &mailbox, turn, gate, close_signal, done_tx)
                        .await;
                }
            }
        }
    }

    /// Pick the live worker's mailbox, or claim the conversation for a new
    /// launch. Waits out a closing worker first.
    async fn route(&self, conversation_id: &ConversationId) -> Route {
        loop {
            let mut workers = self.workers.lock().await;
            match workers.get(conversation_id) {
                Some(entry) if entry.closing => {
                    // The old worker takes no more input; wait it out.
                    let mut done = entry.done.clone();
                    drop(workers);
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Some(entry) => return Route::Queue(Arc::clone(&entry.gate)),
                None => {
                    let gate = Arc::new(Mutex::new(()));
                    let io = Arc::clone(&gate).lock_owned().await;
                    let close_signal = Arc::new(Notify::new());
                    let (done_tx, done_rx) = watch::channel(false);
                    workers.insert(
                        conversation_id.clone(),
                        WorkerEntry {
                            instance: None,
                            started_at: Utc::now(),
                            last_activity: Instant::now(),
                            pending_inputs: 1,
                            closing: false,
                            gate: Arc::clone(&gate),
                            close_signal: Arc::clone(&close_signal),
                            done: done_rx,
                        },
                    );
                    return Route::Launch {
                        gate,
                        io,
                        close_signal,
                        done_tx,
                    };
                }
            }
        }
    }

    /// Count `n` more inputs against the entry behind `gate`. False when
    /// that entry is gone or closing.
    async fn count_input(&self, conversation_id: &ConversationId, gate: &Arc<Mutex<()>>, n: u32) -> bool {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(conversation_id) {
            Some(entry) if entry.owns(gate) && !entry.closing => {
                entry.pending_inputs = entry.pending_inputs.saturating_add(n);
                entry.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    async fn uncount_input(&self, conversation_id: &ConversationId, gate: &Arc<Mutex<()>>) {
        if let Some(entry) = self.workers.lock().await.get_mut(conversation_id) {
            if entry.owns(gate) {
                entry.pending_inputs = entry.pending_inputs.saturating_sub(1);
            }
        }
    }

    async fn start_worker(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        mailbox: &Mailbox,
        turn: Turn,
        gate: Arc<Mutex<()>>,
        close_signal: Arc<Notify>,
        done_tx: watch::Sender<bool>,
    ) -> Result<Dispatch, OrchestratorError> {
        match self.launch(conversation_id, mailbox, turn).await {
            Ok((process, permit)) => {
                let instance = process.name.clone();
                if let Some(entry) = self.workers.lock().await.get_mut(conversation_id) {
                    entry.instance = Some(instance.clone());
                }
                let this = Arc::clone(self);
                let conversation_id = conversation_id.clone();
                tokio::spawn(async move {
                    this.supervise(conversation_id, process, close_signal, done_tx, permit)
                        .await;
                });
                Ok(Dispatch::Launched { instance })
            }
            Err(e) => {
                error!(%conversation_id, error = %e, "worker launch failed");
                let queued = self.retire(conversation_id, &gate).await.leftovers;
                let _ = done_tx.send(true);
                if !queued.is_empty() {
                    warn!(%conversation_id, count = queued.len(), "failing follow-ups queued behind the launch");
                }
                for _ in &queued {
                    self.sink
                        .deliver(Reply::new(
                            conversation_id.clone(),
                            Outcome::Error {
                                message: e.to_string(),
                            },
                            None,
                        ))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        conversation_id: &ConversationId,
        mailbox: &Mailbox,
        turn: Turn,
    ) -> Result<(WorkerProcess, OwnedSemaphorePermit), OrchestratorError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)?;

        let (session_id, runtime) = match self.registry.get(conversation_id).await? {
            Some(record) => (
                record.session_id,
                record
                    .runtime
                    .unwrap_or_else(|| self.settings.default_runtime.clone()),
            ),
            None => (None, self.settings.default_runtime.clone()),
        };
        let envelope = Envelope {
            prompt: turn.prompt,
            session_id,
            conversation_id: conversation_id.clone(),
            is_primary: turn.is_primary,
            is_scheduled: turn.is_scheduled,
            secrets: self.settings.secrets.clone(),
            runtime,
            limits: self.settings.limits,
        };
        debug!(?envelope, "launching worker");
        let mut payload = serde_json::to_vec(&envelope)?;
        payload.push(b'\n');

        let mut process = self.launcher.launch(conversation_id, mailbox.root()).await?;

        // Exactly one envelope; dropping stdin is the end-of-input signal.
        let closed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(tokio::io::sink());
        let mut stdin = std::mem::replace(&mut process.stdin, closed);
        let written = async {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);

        if let Err(e) = written {
            warn!(instance = %process.name, error = %e, "envelope write failed, killing sandbox");
            if let Err(kill_err) = self.launcher.runtime().kill(&process.name).await {
                warn!(instance = %process.name, error = %kill_err, "kill after failed launch");
            }
            return Err(LaunchError::Start {
                name: process.name.clone(),
                reason: format!("envelope write failed: {e}"),
            }
            .into());
        }
        Ok((process, permit))
    }

    /// Write the close sentinel; the worker exits after its current round.
    /// Returns false when no worker is live for the conversation.
    pub async fn close(&self, conversation_id: &ConversationId) -> Result<bool, OrchestratorError> {
        self.close_with(conversation_id, None).await
    }

    /// With `idle_after`, only close a launched worker that has nothing
    /// pending and has been quiet that long.
    async fn close_with(
        &self,
        conversation_id: &ConversationId,
        idle_after: Option<Duration>,
    ) -> Result<bool, OrchestratorError> {
        let Some(gate) = self
            .workers
            .lock()
            .await
            .get(conversation_id)
            .map(|entry| Arc::clone(&entry.gate))
        else {
            return Ok(false);
        };
        let _io = gate.lock().await;

        {
            let workers = self.workers.lock().await;
            let Some(entry) = workers.get(conversation_id).filter(|e| e.owns(&gate)) else {
                return Ok(false);
            };
            if entry.closing {
                return Ok(true);
            }
            if let Some(idle) = idle_after {
                let quiet = entry.instance.is_some()
                    && entry.pending_inputs == 0
                    && entry.last_activity.elapsed() >= idle;
                if !quiet {
                    return Ok(false);
                }
            }
        }

        // Holding the gate keeps new input out until the flag is set.
        self.mailbox(conversation_id).request_close().await?;
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(conversation_id).filter(|e| e.owns(&gate)) {
            entry.closing = true;
            entry.close_signal.notify_one();
            if idle_after.is_some() {
                info!(%conversation_id, instance = ?entry.instance, "worker idle timeout, closing");
            } else {
                info!(%conversation_id, instance = ?entry.instance, "close requested");
            }
        }
        Ok(true)
    }

    /// Stop launching, close every live worker, and wait up to `wait` for
    /// them to exit.
    pub async fn shutdown(&self, wait: Duration) {
        self.slots.close();
        let live: Vec<ConversationId> = self.workers.lock().await.keys().cloned().collect();
        for conversation_id in &live {
            if let Err(e) = self.close(conversation_id).await {
                warn!(%conversation_id, error = %e, "close during shutdown failed");
            }
        }

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.workers.lock().await.is_empty() {
                info!(closed = live.len(), "all workers exited");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(
            remaining = self.workers.lock().await.len(),
            "workers still running at shutdown"
        );
    }

    pub async fn is_running(&self, conversation_id: &ConversationId) -> bool {
        self.workers.lock().await.contains_key(conversation_id)
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.lock().await;
        let mut out: Vec<WorkerSnapshot> = workers
            .iter()
            .map(|(conversation_id, entry)| WorkerSnapshot {
                conversation_id: conversation_id.clone(),
                instance: entry.instance.clone(),
                started_at: entry.started_at,
                idle_secs: entry.last_activity.elapsed().as_secs(),
                awaiting_reply: entry.pending_inputs > 0,
                pending_inputs: entry.pending_inputs,
                closing: entry.closing,
            })
            .collect();
        out.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        out
    }

    /// Background task: close workers with no input for the idle timeout.
    pub async fn run_idle_watchdog(self: Arc<Self>) {
        let idle_timeout = self.settings.idle_timeout;
        let period = (idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(30));
        loop {
            tokio::time::sleep(period).await;
            let idle: Vec<ConversationId> = {
                let workers = self.workers.lock().await;
                workers
                    .iter()
                    .filter(|(_, e)| {
                        e.instance.is_some()
                            && e.pending_inputs == 0
                            && !e.closing
                            && e.last_activity.elapsed() >= idle_timeout
                    })
                    .map(|(conversation_id, _)| conversation_id.clone())
                    .collect()
            };
            // Re-checked under the conversation's gate before the sentinel goes in.
            for conversation_id in idle {
                if let Err(e) = self.close_with(&conversation_id, Some(idle_timeout)).await {
                    warn!(%conversation_id, error = %e, "idle close failed");
                }
            }
        }
    }

    // ========================================================================
    // Per-worker supervision
    // ========================================================================

    async fn supervise(
        self: Arc<Self>,
        conversation_id: ConversationId,
        process: WorkerProcess,
        close_signal: Arc<Notify>,
        done_tx: watch::Sender<bool>,
        _permit: OwnedSemaphorePermit,
    ) {
        let WorkerProcess {
            name,
            stdin,
            stdout,
            stderr,
            mut exited,
        } = process;
        drop(stdin);

        let started = Instant::now();
        let grace = self.settings.grace;
        let diagnostics = Arc::new(std::sync::Mutex::new(DiagnosticTail::new(
            MAX_DIAGNOSTIC_BYTES,
        )));
        tokio::spawn(forward_stderr(name.clone(), stderr, Arc::clone(&diagnostics)));

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = FrameParser::new();
        let lifetime = tokio::time::sleep(self.settings.worker_timeout);
        let escalation = tokio::time::sleep(grace);
        tokio::pin!(lifetime);
        tokio::pin!(escalation);
        let mut stage = Escalation::Idle;
        let mut timed_out = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        match parser.push_line(&line) {
                            ParsedLine::Frame(frame) => {
                                self.on_frame(&conversation_id, &name, frame).await;
                            }
                            ParsedLine::Diagnostic(text) => {
                                debug!(instance = %name, line = %text, "worker output");
                                push_diagnostic(&diagnostics, &text);
                            }
                            ParsedLine::Malformed { error, raw } => {
                                warn!(
                                    %conversation_id,
                                    instance = %name,
                                    error = %error,
                                    bytes = raw.len(),
                                    "dropping malformed result frame"
                                );
                            }
                            ParsedLine::Pending => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(instance = %name, error = %e, "worker output unreadable");
                        break;
                    }
                },
                _ = close_signal.notified(), if stage == Escalation::Idle => {
                    debug!(instance = %name, "waiting for worker to exit after close");
                    stage = Escalation::AwaitExit;
                    escalation.as_mut().reset(tokio::time::Instant::now() + grace);
                }
                _ = &mut escalation, if matches!(stage, Escalation::AwaitExit | Escalation::AwaitStop) => {
                    if stage == Escalation::AwaitExit {
                        warn!(instance = %name, "worker still running after close, stopping sandbox");
                        self.stop_instance(&name).await;
                        stage = Escalation::AwaitStop;
                        escalation.as_mut().reset(tokio::time::Instant::now() + grace);
                    } else {
                        warn!(instance = %name, "sandbox did not stop, killing");
                        self.kill_instance(&name).await;
                        stage = Escalation::Killed;
                    }
                }
                _ = &mut lifetime, if !timed_out => {
                    timed_out = true;
                    warn!(
                        %conversation_id,
                        instance = %name,
                        timeout_secs = self.settings.worker_timeout.as_secs(),
                        "worker lifetime exceeded, stopping sandbox"
                    );
                    self.mark_closing(&conversation_id).await;
                    self.stop_instance(&name).await;
                    stage = Escalation::AwaitStop;
                    escalation.as_mut().reset(tokio::time::Instant::now() + grace);
                }
            }
        }

        if let Some(ParsedLine::Malformed { error, .. }) = parser.finish() {
            warn!(instance = %name, error = %error, "worker output ended inside a frame");
        }

        let code = match tokio::time::timeout(grace, &mut exited).await {
            Ok(code) => code,
            Err(_) => {
                warn!(instance = %name, "worker output closed but process still running, killing");
                self.kill_instance(&name).await;
                tokio::time::timeout(grace, &mut exited).await.ok().flatten()
            }
        };

        let retired = match self.gate_of(&conversation_id, &name).await {
            Some(gate) => self.retire(&conversation_id, &gate).await,
            None => Retired::default(),
        };
        let _ = done_tx.send(true);

        if retired.unanswered > 0 {
            let outcome = if timed_out {
                let err = OrchestratorError::Timeout {
                    instance: name.clone(),
                    after_secs: self.settings.worker_timeout.as_secs(),
                };
                Outcome::Timeout {
                    message: err.to_string(),
                }
            } else {
                let detail = diagnostics
                    .lock()
                    .map(|tail| tail.last_lines(EXIT_DETAIL_LINES))
                    .unwrap_or_default();
                let err = OrchestratorError::WorkerExited {
                    instance: name.clone(),
                    code,
                    detail: if detail.is_empty() {
                        "no output".to_string()
                    } else {
                        detail
                    },
                };
                warn!(
                    %conversation_id,
                    error = %err,
                    unanswered = retired.unanswered,
                    "worker exited with a pending round"
                );
                Outcome::Error {
                    message: err.to_string(),
                }
            };
            self.sink
                .deliver(Reply::new(conversation_id.clone(), outcome, None))
                .await;
        }

        info!(
            %conversation_id,
            instance = %name,
            ?code,
            timed_out,
            elapsed_secs = started.elapsed().as_secs(),
            "worker exited"
        );

        if !retired.leftovers.is_empty() {
            info!(
                %conversation_id,
                count = retired.leftovers.len(),
                "relaunching for unconsumed follow-ups"
            );
            spawn_requeue(self, conversation_id, retired.leftovers.join("\n"));
        }
    }

    async fn on_frame(&self, conversation_id: &ConversationId, instance: &str, frame: ResultFrame) {
        if let Some(session_id) = &frame.new_session_id {
            if let Err(e) = self.registry.record_session(conversation_id, session_id).await {
                error!(%conversation_id, error = %e, "failed to record session");
            }
        }
        if let Some(entry) = self.workers.lock().await.get_mut(conversation_id) {
            if entry.instance.as_deref() == Some(instance) {
                // Frames without a count predate it and answer everything.
                entry.pending_inputs = match frame.inputs {
                    Some(n) => entry.pending_inputs.saturating_sub(n),
                    None => 0,
                };
                entry.last_activity = Instant::now();
            }
        }

        let outcome = if frame.is_success() {
            match frame.result {
                Some(text) => Outcome::Success { text },
                None => {
                    debug!(%conversation_id, instance, "session-only frame");
                    return;
                }
            }
        } else {
            Outcome::Error {
                message: frame
                    .error
                    .unwrap_or_else(|| "worker reported an error".to_string()),
            }
        };
        debug!(%conversation_id, instance, "result frame delivered");
        self.sink
            .deliver(Reply::new(
                conversation_id.clone(),
                outcome,
                frame.new_session_id,
            ))
            .await;
    }

    async fn mark_closing(&self, conversation_id: &ConversationId) {
        if let Some(entry) = self.workers.lock().await.get_mut(conversation_id) {
            entry.closing = true;
        }
    }

    async fn gate_of(&self, conversation_id: &ConversationId, instance: &str) -> Option<Arc<Mutex<()>>> {
        self.workers
            .lock()
            .await
            .get(conversation_id)
            .filter(|e| e.instance.as_deref() == Some(instance))
            .map(|e| Arc::clone(&e.gate))
    }

    /// Take the conversation out of service: no new input, collect what
    /// the worker never drained, then drop the entry. The drain happens
    /// before removal so a racing launch cannot reset those records away.
    async fn retire(&self, conversation_id: &ConversationId, gate: &Arc<Mutex<()>>) -> Retired {
        let _io = gate.lock().await;
        if let Some(entry) = self.workers.lock().await.get_mut(conversation_id) {
            if entry.owns(gate) {
                entry.closing = true;
            }
        }

        let leftovers = match self.mailbox(conversation_id).drain().await {
            Ok(left) => left,
            Err(e) => {
                warn!(%conversation_id, error = %e, "could not inspect mailbox after exit");
                Vec::new()
            }
        };

        let mut workers = self.workers.lock().await;
        let owned = workers.get(conversation_id).is_some_and(|e| e.owns(gate));
        let pending = if owned {
            workers
                .remove(conversation_id)
                .map_or(0, |e| e.pending_inputs)
        } else {
            0
        };
        let drained = u32::try_from(leftovers.len()).unwrap_or(u32::MAX);
        Retired {
            unanswered: pending.saturating_sub(drained),
            leftovers,
        }
    }

    async fn stop_instance(&self, name: &str) {
        if let Err(e) = self.launcher.runtime().stop(name).await {
            warn!(instance = name, error = %e, "sandbox stop failed");
        }
    }

    async fn kill_instance(&self, name: &str) {
        if let Err(e) = self.launcher.runtime().kill(name).await {
            warn!(instance = name, error = %e, "sandbox kill failed");
        }
    }
}

/// What a departing worker left behind.
#[derive(Debug, Default)]
struct Retired {
    /// Inputs consumed by the worker that no frame answered.
    unanswered: u32,
    /// Mailbox messages the worker never drained.
    leftovers: Vec<String>,
}

fn spawn_requeue(orchestrator: Arc<Orchestrator>, conversation_id: ConversationId, prompt: String) {
    tokio::spawn(async move {
        if let Err(e) = orchestrator
            .send(&conversation_id, Turn::new(prompt))
            .await
        {
            orchestrator
                .sink
                .deliver(Reply::new(
                    conversation_id,
                    Outcome::Error {
                        message: e.to_string(),
                    },
                    None,
                ))
                .await;
        }
    });
}

async fn forward_stderr(
    instance: String,
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    diagnostics: Arc<std::sync::Mutex<DiagnosticTail>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(instance = %instance, "{line}");
        push_diagnostic(&diagnostics, &line);
    }
}

fn push_diagnostic(diagnostics: &std::sync::Mutex<DiagnosticTail>, line: &str) {
    diagnostics
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(line);
}

/// Rolling tail of worker diagnostics, bounded in bytes.
#[derive(Debug)]
struct DiagnosticTail {
    buf: String,
    cap: usize,
}

impl DiagnosticTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn last_lines(&self, n: usize) -> String {
        let lines: Vec<&str> = self.buf.lines().collect();
        lines[lines.len().saturating_sub(n)..].join(" | ")
    }
}
