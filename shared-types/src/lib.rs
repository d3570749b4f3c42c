//! Shared types between the hypervisor and the in-sandbox worker
//!
//! Everything that crosses the sandbox boundary is defined here:
//! - the task envelope written once to the worker's stdin
//! - result frames the worker prints to stdout between fixed markers
//! - the filesystem mailbox carrying follow-up input and the close sentinel
//!
//! Serializable with serde for JSON over stdin/stdout and mailbox records.

pub mod mailbox;
pub mod protocol;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use mailbox::{Mailbox, MailboxError, CLOSE_SENTINEL};
pub use protocol::{
    encode_frame, write_frame, FrameError, FrameParser, ParsedLine, OUTPUT_END_MARKER,
    OUTPUT_START_MARKER,
};

// ============================================================================
// Core Types
// ============================================================================

/// Conversation identity (group/channel key)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Task Envelope
// ============================================================================

/// Backend/runtime selection, dispatched once when the worker initializes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeSelection {
    /// HTTP session server (`opencode serve`) started inside the sandbox.
    Opencode {
        provider: String,
        model: String,
        /// Name of the secret holding the provider API key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
    /// The `claude` CLI in print mode.
    Claude {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
}

impl RuntimeSelection {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opencode { .. } => "opencode",
            Self::Claude { .. } => "claude",
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Opencode { model, .. } => Some(model),
            Self::Claude { model, .. } => model.as_deref(),
        }
    }

    pub fn credential(&self) -> Option<&str> {
        match self {
            Self::Opencode { credential, .. } | Self::Claude { credential, .. } => {
                credential.as_deref()
            }
        }
    }
}

impl Default for RuntimeSelection {
    fn default() -> Self {
        Self::Claude {
            model: None,
            credential: None,
        }
    }
}

/// Timing policy the worker runs under.
///
/// `round_timeout_ms` must be strictly shorter than the hypervisor's
/// whole-lifetime timeout for the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLimits {
    pub round_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// When true a round timeout ends the worker; otherwise the worker
    /// reports the timeout and keeps waiting for input.
    pub round_timeout_terminates: bool,
}

impl WorkerLimits {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            round_timeout_ms: 25 * 60 * 1000,
            poll_interval_ms: 500,
            round_timeout_terminates: true,
        }
    }
}

/// The single message written to a worker's stdin at launch.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub is_primary: bool,
    /// Machine-generated (scheduled) prompt rather than user-authored.
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    pub runtime: RuntimeSelection,
    #[serde(default)]
    pub limits: WorkerLimits,
}

// Secret values never reach logs.
impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("prompt_len", &self.prompt.len())
            .field("session_id", &self.session_id)
            .field("conversation_id", &self.conversation_id)
            .field("is_primary", &self.is_primary)
            .field("is_scheduled", &self.is_scheduled)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("runtime", &self.runtime)
            .field("limits", &self.limits)
            .finish()
    }
}

// ============================================================================
// Result Frame
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Success,
    Error,
}

/// One reply emitted by the worker per completed round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultFrame {
    pub status: FrameStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How many caller inputs this frame answers: the envelope plus any
    /// folded mailbox messages for the first round, the drained messages
    /// for later ones. Absent means "everything sent so far".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<u32>,
}

impl ResultFrame {
    pub fn success(result: Option<String>, session_id: Option<String>) -> Self {
        Self {
            status: FrameStatus::Success,
            result,
            new_session_id: session_id,
            error: None,
            inputs: None,
        }
    }

    pub fn failure(error: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            status: FrameStatus::Error,
            result: None,
            new_session_id: session_id,
            error: Some(error.into()),
            inputs: None,
        }
    }

    pub fn with_inputs(mut self, inputs: u32) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == FrameStatus::Success
    }
}

// ============================================================================
// Mailbox records
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MailboxMessageKind {
    Message,
    #[serde(other)]
    Unknown,
}

/// Follow-up input published into a live worker's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxMessage {
    #[serde(rename = "type")]
    pub kind: MailboxMessageKind,
    pub text: String,
}

impl MailboxMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MailboxMessageKind::Message,
            text: text.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
