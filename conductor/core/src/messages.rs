//! Server Messages
//!
//! Messages sent from the Conductor to connected clients. Every message is a
//! JSON object discriminated by its `type` field, so transports can forward
//! them without knowing anything about their payloads.
//!
//! # Design Philosophy
//!
//! The Conductor decides what happens in a conversation; clients only render
//! what they are told. Messages are also the unit of replay: while a client
//! is detached, the session registry queues these values verbatim and hands
//! them back, in order, on the next attach.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::{EditAction, EditResult};

/// Messages from the Conductor to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // ============================================
    // Conversation Messages
    // ============================================
    /// A fragment of chat text that is safe to show
    TextChunk {
        /// Assistant message this fragment belongs to
        #[serde(rename = "messageId")]
        message_id: MessageId,
        /// The fragment
        text: String,
    },

    /// The assistant finished its turn
    MessageComplete {
        /// Assistant message that completed
        #[serde(rename = "messageId")]
        message_id: MessageId,
        /// Full chat text of the turn (lets clients reconcile dropped chunks)
        content: String,
    },

    /// Conversation history for a (re)connecting client
    History {
        /// Messages, oldest first
        messages: Vec<HistoryEntry>,
    },

    /// Opening message for a fresh conversation
    Greeting {
        /// The greeting text
        content: String,
    },

    /// Something went wrong with the current request
    Error {
        /// Machine-readable code (`busy`, `timeout`, `backend`, ...)
        code: String,
        /// Human-readable description
        message: String,
    },

    // ============================================
    // Document Messages
    // ============================================
    /// The agent is about to edit the shared document
    DocumentEditStart {
        /// Room whose document is edited
        #[serde(rename = "roomRef")]
        room_ref: RoomId,
        /// Number of operations in the batch
        #[serde(rename = "editCount")]
        edit_count: usize,
    },

    /// The agent finished editing the shared document
    DocumentEditEnd {
        /// Room whose document was edited
        #[serde(rename = "roomRef")]
        room_ref: RoomId,
        /// Per-operation results, in batch order
        results: Vec<EditOutcome>,
    },

    // ============================================
    // Agent Metadata
    // ============================================
    /// Token accounting for one model call
    TokenUsage {
        /// Prompt tokens
        #[serde(rename = "inputTokens")]
        input_tokens: u64,
        /// Completion tokens
        #[serde(rename = "outputTokens")]
        output_tokens: u64,
    },

    /// Questions the agent wants the user to think about
    OpenQuestions {
        /// The questions
        questions: Vec<String>,
    },

    /// Quick replies the client may offer
    SuggestedResponses {
        /// The suggested replies
        responses: Vec<String>,
    },

    /// Progress through the agent's iteration loop
    AgentProgress {
        /// Current pass (1-based)
        iteration: u32,
        /// Maximum passes allowed
        #[serde(rename = "maxIterations")]
        max_iterations: u32,
        /// What the agent is doing
        status: String,
    },
}

impl ServerMessage {
    /// Build an error message
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The `type` tag this message serializes with
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextChunk { .. } => "text_chunk",
            Self::MessageComplete { .. } => "message_complete",
            Self::History { .. } => "history",
            Self::Greeting { .. } => "greeting",
            Self::Error { .. } => "error",
            Self::DocumentEditStart { .. } => "document_edit_start",
            Self::DocumentEditEnd { .. } => "document_edit_end",
            Self::TokenUsage { .. } => "token_usage",
            Self::OpenQuestions { .. } => "open_questions",
            Self::SuggestedResponses { .. } => "suggested_responses",
            Self::AgentProgress { .. } => "agent_progress",
        }
    }
}

/// Wire form of one [`EditResult`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    /// Whether the edit was applied
    pub success: bool,
    /// Which kind of edit it was
    pub action: EditAction,
    /// Why it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&EditResult> for EditOutcome {
    fn from(result: &EditResult) -> Self {
        Self {
            success: result.success,
            action: result.action,
            error: result.error.clone(),
        }
    }
}

/// One message of conversation history as sent to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Message ID
    pub id: MessageId,
    /// Who sent it
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Creation time (Unix ms)
    pub timestamp: u64,
}

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("msg_{id}"))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical session identifier
///
/// Chosen by the client. Anonymous sessions get a generated ID and may
/// later be transferred to a durable one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wrap a client-supplied ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an ID for an anonymous session
    #[must_use]
    pub fn anonymous() -> Self {
        Self(format!("anon-{}", uuid::Uuid::new_v4()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a shared document room
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Wrap a room reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// The co-authoring agent
    Assistant,
    /// System notice
    System,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_unique() {
        let id1 = MessageId::new();
        let id2 = MessageId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_anonymous_session_ids_unique() {
        let id1 = SessionId::anonymous();
        let id2 = SessionId::anonymous();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("anon-"));
    }

    #[test]
    fn test_server_message_type_tag() {
        let msg = ServerMessage::TextChunk {
            message_id: MessageId("msg_7".to_string()),
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "text_chunk");
        assert_eq!(json["messageId"], "msg_7");
        assert_eq!(msg.kind(), "text_chunk");
    }

    #[test]
    fn test_token_usage_field_names() {
        let msg = ServerMessage::TokenUsage {
            input_tokens: 12,
            output_tokens: 34,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "token_usage");
        assert_eq!(json["inputTokens"], 12);
        assert_eq!(json["outputTokens"], 34);
    }

    #[test]
    fn test_edit_outcome_omits_empty_error() {
        let outcome = EditOutcome {
            success: true,
            action: EditAction::Insert,
            error: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["action"], "insert");
    }
}
