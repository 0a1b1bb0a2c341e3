//! Conversation History
//!
//! Per-session chat history kept in memory. It is replayed to reconnecting
//! clients as a `history` message and sent to the model as prior turns.
//!
//! # Design Philosophy
//!
//! History belongs to the session, not to a connection: a client can
//! disconnect mid-generation and the assistant's reply is still recorded
//! when the generation finishes in the background.

use serde::{Deserialize, Serialize};

use crate::backend::ChatTurn;
use crate::messages::{HistoryEntry, MessageId, MessageRole};

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created (Unix timestamp ms)
    pub timestamp: u64,
}

impl ConversationMessage {
    /// Create a new message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self::with_id(MessageId::new(), role, content)
    }

    /// Create a message with a known ID (assistant replies reuse their stream ID)
    pub fn with_id(id: MessageId, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }
}

impl From<&ConversationMessage> for HistoryEntry {
    fn from(msg: &ConversationMessage) -> Self {
        Self {
            id: msg.id.clone(),
            role: msg.role,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

/// Bounded conversation history
#[derive(Clone, Debug, Default)]
pub struct ChatHistory {
    messages: Vec<ConversationMessage>,
    /// Maximum number of messages to keep (0 = unlimited)
    max_messages: usize,
    /// Current total content bytes
    content_bytes: usize,
}

impl ChatHistory {
    /// Create an empty history keeping at most `max_messages` (0 = unlimited)
    #[must_use]
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages,
            content_bytes: 0,
        }
    }

    /// Add a user message
    pub fn add_user_message(&mut self, content: impl Into<String>) -> MessageId {
        self.push(ConversationMessage::new(MessageRole::User, content))
    }

    /// Add a completed assistant reply
    pub fn add_assistant_message(&mut self, id: MessageId, content: impl Into<String>) -> MessageId {
        self.push(ConversationMessage::with_id(id, MessageRole::Assistant, content))
    }

    /// Add a system notice
    pub fn add_system_message(&mut self, content: impl Into<String>) -> MessageId {
        self.push(ConversationMessage::new(MessageRole::System, content))
    }

    fn push(&mut self, msg: ConversationMessage) -> MessageId {
        let id = msg.id.clone();
        self.content_bytes += msg.content.len();
        self.messages.push(msg);
        self.prune_if_needed();
        id
    }

    /// Get the last N messages for context
    #[must_use]
    pub fn recent_messages(&self, count: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// Get all messages
    #[must_use]
    pub fn all_messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Wire form for a `history` message
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.messages.iter().map(HistoryEntry::from).collect()
    }

    /// Prior turns for the model
    #[must_use]
    pub fn turns(&self) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .map(|m| ChatTurn::new(m.role, m.content.clone()))
            .collect()
    }

    /// Clear message history
    pub fn clear(&mut self) {
        self.messages.clear();
        self.content_bytes = 0;
    }

    /// Get current message count
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing has been said yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get current content size in bytes
    #[must_use]
    pub fn content_bytes(&self) -> usize {
        self.content_bytes
    }

    /// Remove oldest messages beyond the limit
    fn prune_if_needed(&mut self) {
        if self.max_messages == 0 || self.messages.len() <= self.max_messages {
            return;
        }
        let to_remove = self.messages.len() - self.max_messages;
        for msg in self.messages.drain(..to_remove) {
            self.content_bytes = self.content_bytes.saturating_sub(msg.content.len());
        }
        tracing::debug!(
            removed = to_remove,
            remaining = self.messages.len(),
            "Pruned session history"
        );
    }
}

/// Get current timestamp in milliseconds
fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
