//! In-memory reply buffer behind the HTTP API.
//!
//! A chat-platform adapter would implement [`ReplySink`] directly; this one
//! holds outcomes until a client drains them.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use shared_types::ConversationId;
use tokio::sync::Mutex;
use tracing::warn;

use crate::orchestrator::{Reply, ReplySink};

const MAX_BUFFERED_PER_CONVERSATION: usize = 256;

#[derive(Debug, Default)]
pub struct ReplyOutbox {
    replies: Mutex<HashMap<ConversationId, VecDeque<Reply>>>,
}

impl ReplyOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every buffered reply for a conversation, oldest first.
    pub async fn take(&self, conversation_id: &ConversationId) -> Vec<Reply> {
        self.replies
            .lock()
            .await
            .remove(conversation_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn pending(&self, conversation_id: &ConversationId) -> usize {
        self.replies
            .lock()
            .await
            .get(conversation_id)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl ReplySink for ReplyOutbox {
    async fn deliver(&self, reply: Reply) {
        let mut replies = self.replies.lock().await;
        let queue = replies.entry(reply.conversation_id.clone()).or_default();
        if queue.len() >= MAX_BUFFERED_PER_CONVERSATION {
            warn!(
                conversation_id = %reply.conversation_id,
                "reply outbox full, dropping oldest reply"
            );
            queue.pop_front();
        }
        queue.push_back(reply);
    }
}
