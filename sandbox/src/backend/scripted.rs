//! In-process backend with scripted replies.
//!
//! Sessions and counters live behind a shared [`ScriptedHandle`], so several
//! worker lifetimes can run against the same "backend storage" the way real
//! workers share a persistent session store.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AgentBackend, BackendError, BackendReply, PartialFeed, PartialOutput};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Delayed(Duration, String),
    /// Final content comes back empty after these cumulative partial updates.
    EmptyAfterPartials(Vec<String>),
    Fail(String),
    /// Never resolves; only a round timeout ends it.
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    known_sessions: HashSet<String>,
    created: u32,
    replies: VecDeque<ScriptedReply>,
    prompts: Vec<(String, String)>,
    starts: u32,
    shutdowns: u32,
    fail_start: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.lock().replies.push_back(reply);
    }

    pub fn add_session(&self, session_id: impl Into<String>) {
        self.lock().known_sessions.insert(session_id.into());
    }

    /// Simulate backend storage that did not survive.
    pub fn forget_sessions(&self) {
        self.lock().known_sessions.clear();
    }

    /// `(session_id, prompt)` for every submitted prompt, in order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.lock().prompts.clone()
    }

    pub fn sessions_created(&self) -> u32 {
        self.lock().created
    }

    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    pub fn shutdowns(&self) -> u32 {
        self.lock().shutdowns
    }

    pub fn fail_next_start(&self, reason: impl Into<String>) {
        self.lock().fail_start = Some(reason.into());
    }

    /// A fresh backend instance over this shared state.
    pub fn backend(&self) -> ScriptedBackend {
        ScriptedBackend {
            handle: self.clone(),
            partial_tx: None,
        }
    }
}

pub struct ScriptedBackend {
    handle: ScriptedHandle,
    partial_tx: Option<mpsc::UnboundedSender<PartialOutput>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        ScriptedHandle::default().backend()
    }

    pub fn handle(&self) -> ScriptedHandle {
        self.handle.clone()
    }

    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.handle.add_session(session_id);
        self
    }

    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.handle.push_reply(reply);
        self
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(&mut self) -> Result<PartialFeed, BackendError> {
        {
            let mut state = self.handle.lock();
            state.starts += 1;
            if let Some(reason) = state.fail_start.take() {
                return Err(BackendError::Start(reason));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.partial_tx = Some(tx);
        Ok(rx)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError> {
        Ok(self.handle.lock().known_sessions.contains(session_id))
    }

    async fn create_session(&self) -> Result<String, BackendError> {
        let mut state = self.handle.lock();
        state.created += 1;
        let mut n = state.created;
        while state.known_sessions.contains(&format!("s{n}")) {
            n += 1;
        }
        let id = format!("s{n}");
        state.known_sessions.insert(id.clone());
        Ok(id)
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<BackendReply, BackendError> {
        let reply = {
            let mut state = self.handle.lock();
            state
                .prompts
                .push((session_id.to_string(), text.to_string()));
            if !state.known_sessions.contains(session_id) {
                return Err(BackendError::Request(format!(
                    "unknown session {session_id}"
                )));
            }
            state.replies.pop_front()
        };

        match reply {
            None => Ok(BackendReply {
                text: Some(format!("re: {text}")),
                session_id: None,
            }),
            Some(ScriptedReply::Text(text)) => Ok(BackendReply {
                text: Some(text),
                session_id: None,
            }),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(BackendReply {
                    text: Some(text),
                    session_id: None,
                })
            }
            Some(ScriptedReply::EmptyAfterPartials(partials)) => {
                if let Some(tx) = &self.partial_tx {
                    for text in partials {
                        let _ = tx.send(PartialOutput {
                            session_id: session_id.to_string(),
                            text,
                        });
                    }
                }
                Ok(BackendReply {
                    text: Some(String::new()),
                    session_id: None,
                })
            }
            Some(ScriptedReply::Fail(reason)) => Err(BackendError::Request(reason)),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Ok(BackendReply::default())
            }
        }
    }

    async fn shutdown(&self) {
        self.handle.lock().shutdowns += 1;
    }
}
