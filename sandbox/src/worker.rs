//! Worker loop: the request/response cycle run inside the sandbox.
//!
//! ```text
//! Initializing -> ResolvingSession -> RoundActive -> AwaitingInput -> RoundActive ...
//!                                          |               |
//!                                          +--> Closing <--+--> Closed
//! ```
//!
//! One result frame is written per round. The loop never reads stdin; after
//! the envelope, the mailbox is the only input.

use std::time::Duration;

use shared_types::{write_frame, Envelope, Mailbox, MailboxError, ResultFrame};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::backend::{AgentBackend, BackendError, PartialFeed};

/// Prefix applied to machine-generated prompts so the agent can tell them
/// apart from user-authored text.
pub const SCHEDULED_PREFIX: &str = "[Scheduled task: this message was not sent by a user]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    ResolvingSession,
    RoundActive,
    AwaitingInput,
    Closing,
    Closed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::ResolvingSession => "resolving_session",
            Self::RoundActive => "round_active",
            Self::AwaitingInput => "awaiting_input",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Close sentinel observed while awaiting input.
    CloseRequested,
    /// A round exceeded its budget and the policy ends the worker.
    RoundTimeout,
    /// The backend could not be started or no session could be obtained.
    StartFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub reason: ExitReason,
    pub rounds: u32,
    pub session_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("failed to write result frame: {0}")]
    Output(#[from] std::io::Error),
}

enum RoundOutcome {
    Finished(ResultFrame),
    TimedOut(ResultFrame),
}

enum NextInput {
    /// Joined text and the number of messages it was built from.
    Prompt(String, u32),
    Close,
}

pub struct WorkerLoop<W> {
    envelope: Envelope,
    backend: Box<dyn AgentBackend>,
    mailbox: Mailbox,
    out: W,
    state: WorkerState,
    session_id: Option<String>,
    rounds: u32,
}

impl<W> WorkerLoop<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(envelope: Envelope, backend: Box<dyn AgentBackend>, mailbox: Mailbox, out: W) -> Self {
        Self {
            envelope,
            backend,
            mailbox,
            out,
            state: WorkerState::Initializing,
            session_id: None,
            rounds: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(
            conversation_id = %self.envelope.conversation_id,
            from = %self.state,
            to = %next,
            "worker state transition"
        );
        self.state = next;
    }

    /// Drive the worker to completion. The backend is always shut down,
    /// including when a frame cannot be written.
    pub async fn run(mut self) -> Result<WorkerExit, WorkerError> {
        info!(
            conversation_id = %self.envelope.conversation_id,
            backend = self.backend.name(),
            is_primary = self.envelope.is_primary,
            resume = self.envelope.session_id.is_some(),
            "worker starting"
        );

        let result = self.drive().await;

        self.transition(WorkerState::Closing);
        self.backend.shutdown().await;
        self.transition(WorkerState::Closed);

        match &result {
            Ok(exit) => info!(
                conversation_id = %self.envelope.conversation_id,
                reason = ?exit.reason,
                rounds = exit.rounds,
                session_id = ?exit.session_id,
                "worker closed"
            ),
            Err(e) => warn!(
                conversation_id = %self.envelope.conversation_id,
                error = %e,
                "worker stopped on error"
            ),
        }
        result
    }

    async fn drive(&mut self) -> Result<WorkerExit, WorkerError> {
        let mut feed = match self.backend.start().await {
            Ok(feed) => feed,
            Err(e) => return self.fail_start(e).await,
        };

        self.transition(WorkerState::ResolvingSession);
        let mut session_id = match self.resolve_session().await {
            Ok(id) => id,
            Err(e) => return self.fail_start(e).await,
        };
        self.session_id = Some(session_id.clone());

        let (mut prompt, mut inputs) = self.initial_prompt().await;
        loop {
            self.transition(WorkerState::RoundActive);
            self.rounds += 1;
            let outcome = self.run_round(&mut feed, &session_id, &prompt).await;

            let (frame, timed_out) = match outcome {
                RoundOutcome::Finished(frame) => (frame.with_inputs(inputs), false),
                RoundOutcome::TimedOut(frame) => (frame.with_inputs(inputs), true),
            };
            if let Some(id) = &frame.new_session_id {
                session_id = id.clone();
                self.session_id = Some(id.clone());
            }
            write_frame(&mut self.out, &frame).await?;
            debug!(
                conversation_id = %self.envelope.conversation_id,
                round = self.rounds,
                success = frame.is_success(),
                "result frame written"
            );

            if timed_out && self.envelope.limits.round_timeout_terminates {
                return Ok(self.exit(ExitReason::RoundTimeout));
            }

            self.transition(WorkerState::AwaitingInput);
            match self.await_input().await? {
                NextInput::Prompt(next, count) => {
                    prompt = next;
                    inputs = count;
                }
                NextInput::Close => return Ok(self.exit(ExitReason::CloseRequested)),
            }
        }
    }

    fn exit(&self, reason: ExitReason) -> WorkerExit {
        WorkerExit {
            reason,
            rounds: self.rounds,
            session_id: self.session_id.clone(),
        }
    }

    async fn fail_start(&mut self, error: BackendError) -> Result<WorkerExit, WorkerError> {
        warn!(
            conversation_id = %self.envelope.conversation_id,
            error = %error,
            "worker could not start a round"
        );
        let frame = ResultFrame::failure(error.to_string(), self.session_id.clone()).with_inputs(1);
        write_frame(&mut self.out, &frame).await?;
        Ok(self.exit(ExitReason::StartFailed))
    }

    /// Reuse the envelope's session only if the backend still knows it.
    async fn resolve_session(&self) -> Result<String, BackendError> {
        if let Some(prior) = &self.envelope.session_id {
            match self.backend.session_exists(prior).await {
                Ok(true) => {
                    debug!(session_id = %prior, "resuming session");
                    return Ok(prior.clone());
                }
                Ok(false) => info!(session_id = %prior, "stored session not found, creating a new one"),
                Err(e) => warn!(
                    session_id = %prior,
                    error = %e,
                    "session check failed, creating a new one"
                ),
            }
        }
        let created = self.backend.create_session().await?;
        info!(session_id = %created, "session created");
        Ok(created)
    }

    /// The envelope prompt plus anything published before the first poll,
    /// with the number of inputs folded in.
    async fn initial_prompt(&self) -> (String, u32) {
        let mut prompt = if self.envelope.is_scheduled {
            format!("{SCHEDULED_PREFIX}\n\n{}", self.envelope.prompt)
        } else {
            self.envelope.prompt.clone()
        };
        let mut inputs = 1;
        match self.mailbox.drain().await {
            Ok(pending) if !pending.is_empty() => {
                debug!(count = pending.len(), "folding early mailbox messages into first prompt");
                inputs += count_of(&pending);
                prompt.push('\n');
                prompt.push_str(&pending.join("\n"));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to drain mailbox before first round"),
        }
        (prompt, inputs)
    }

    async fn run_round(&self, feed: &mut PartialFeed, session_id: &str, prompt: &str) -> RoundOutcome {
        // Updates left over from an earlier round must not leak into this one.
        while feed.try_recv().is_ok() {}

        let budget = self.envelope.limits.round_timeout();
        let mut latest: Option<String> = None;

        let call = self.backend.prompt(session_id, prompt);
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(call);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                res = &mut call => break Some(res),
                Some(update) = feed.recv() => {
                    if update.session_id == session_id {
                        latest = Some(update.text);
                    }
                }
                _ = &mut deadline => break None,
            }
        };

        while let Ok(update) = feed.try_recv() {
            if update.session_id == session_id {
                latest = Some(update.text);
            }
        }

        match result {
            Some(Ok(reply)) => {
                let session = reply.session_id.unwrap_or_else(|| session_id.to_string());
                let text = reply
                    .text
                    .filter(|t| !t.trim().is_empty())
                    .or_else(|| latest.filter(|t| !t.trim().is_empty()));
                if text.is_none() {
                    debug!(session_id = %session, "round finished without content");
                }
                RoundOutcome::Finished(ResultFrame::success(text, Some(session)))
            }
            Some(Err(e)) => {
                warn!(session_id, error = %e, "round failed");
                RoundOutcome::Finished(ResultFrame::failure(e.to_string(), Some(session_id.to_string())))
            }
            None => {
                warn!(session_id, budget_ms = budget.as_millis() as u64, "round timed out");
                RoundOutcome::TimedOut(ResultFrame::failure(
                    format!("round timed out after {}", format_duration(budget)),
                    Some(session_id.to_string()),
                ))
            }
        }
    }

    /// Sentinel first, then messages, then sleep. Never times out.
    async fn await_input(&self) -> Result<NextInput, WorkerError> {
        let interval = self.envelope.limits.poll_interval();
        loop {
            if self.mailbox.poll_close().await? {
                info!(conversation_id = %self.envelope.conversation_id, "close requested");
                return Ok(NextInput::Close);
            }
            let texts = self.mailbox.drain().await?;
            if !texts.is_empty() {
                // A sentinel that landed during the drain still wins.
                if self.mailbox.poll_close().await? {
                    info!(
                        conversation_id = %self.envelope.conversation_id,
                        discarded = texts.len(),
                        "close requested"
                    );
                    return Ok(NextInput::Close);
                }
                debug!(count = texts.len(), "mailbox messages received");
                return Ok(NextInput::Prompt(texts.join("\n"), count_of(&texts)));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn count_of(texts: &[String]) -> u32 {
    u32::try_from(texts.len()).unwrap_or(u32::MAX)
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() > 0 && d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
