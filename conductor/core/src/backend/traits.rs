//! LLM Backend Traits
//!
//! Trait definitions for LLM backends. The Conductor only ever sees a
//! stream of tokens followed by a completion (or an error), so swapping
//! providers never touches classification or editing.
//!
//! # Design Philosophy
//!
//! The LlmBackend trait provides a common interface for:
//! - Streaming a chat completion token by token
//! - One-shot completions (greeting batches)
//! - Health checking the backend
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::messages::MessageRole;

/// Token accounting reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

/// Token stream events from LLM backends
#[derive(Clone, Debug)]
pub enum StreamingToken {
    /// A token from the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (may differ from concatenated tokens)
        message: String,
        /// Token accounting, when the backend reports it
        usage: Option<TokenUsage>,
    },
    /// Error occurred during streaming
    Error(String),
}

/// One turn of the conversation sent to the model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    /// Who said it
    pub role: MessageRole,
    /// What was said
    pub content: String,
}

impl ChatTurn {
    /// Create a turn
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Configuration for LLM requests
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// Conversation turns, oldest first
    pub messages: Vec<ChatTurn>,
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Whether to stream the response
    pub stream: bool,
    /// Maximum tokens in response (0 = default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// System prompt (optional, sent before all turns)
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            model: String::new(),
            stream: true,
            max_tokens: 0,
            temperature: 0.7,
            system: None,
        }
    }
}

impl LlmRequest {
    /// Create a request with a single user prompt
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self::chat(model).with_turn(MessageRole::User, prompt)
    }

    /// Create a request with no turns yet
    pub fn chat(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a turn
    #[must_use]
    pub fn with_turn(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.messages.push(ChatTurn::new(role, content));
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Content of the most recent user turn
    #[must_use]
    pub fn last_user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|t| t.role == MessageRole::User)
            .map(|t| t.content.as_str())
    }
}

/// Response from non-streaming LLM request
#[derive(Clone, Debug)]
pub struct LlmResponse {
    /// The response text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Token accounting (if available)
    pub usage: Option<TokenUsage>,
    /// Response generation time in milliseconds
    pub duration_ms: Option<u64>,
}

/// LLM Backend trait
///
/// Implement this trait to add support for different LLM providers.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Send a request and get a streaming response
    ///
    /// Returns a channel receiver that will receive tokens as they arrive.
    /// The channel will be closed when the response is complete or an error occurs.
    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// Send a request and wait for complete response (non-streaming)
    async fn send(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_request_builder() {
        let request = LlmRequest::new("Hello", "llama3")
            .with_stream(false)
            .with_temperature(1.5)
            .with_system("You are helpful")
            .with_max_tokens(100);

        assert_eq!(request.messages, vec![ChatTurn::new(MessageRole::User, "Hello")]);
        assert_eq!(request.model, "llama3");
        assert!(!request.stream);
        assert!((request.temperature - 1.0).abs() < f32::EPSILON);
        assert_eq!(request.system, Some("You are helpful".to_string()));
        assert_eq!(request.max_tokens, 100);
    }

    #[test]
    fn test_last_user_prompt() {
        let request = LlmRequest::chat("m")
            .with_turn(MessageRole::User, "first")
            .with_turn(MessageRole::Assistant, "reply")
            .with_turn(MessageRole::User, "second")
            .with_turn(MessageRole::Assistant, "again");
        assert_eq!(request.last_user_prompt(), Some("second"));
        assert_eq!(LlmRequest::chat("m").last_user_prompt(), None);
    }

    #[test]
    fn test_chat_turn_serializes_lowercase_role() {
        let json = serde_json::to_value(ChatTurn::new(MessageRole::Assistant, "x")).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
