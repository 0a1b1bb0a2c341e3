//! Scripted Backend
//!
//! A deterministic [`LlmBackend`] for tests and local demos. Each call to
//! `send_streaming` pops the next scripted reply; every request is recorded
//! so tests can assert on the prompts the Conductor built.
//!
//! # Usage
//!
//! ```
//! use coauthor_core::backend::{ScriptedBackend, ScriptedReply};
//!
//! let backend = ScriptedBackend::new()
//!     .with_reply(ScriptedReply::text("Hello there"))
//!     .with_reply(ScriptedReply::Fail("model offline".to_string()));
//! assert_eq!(backend.pending_replies(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{LlmBackend, LlmRequest, LlmResponse, StreamingToken, TokenUsage};

/// Characters per streamed token when splitting scripted text
const TOKEN_CHARS: usize = 3;

/// One scripted response
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Stream these tokens, then complete
    Tokens(Vec<String>),
    /// `send_streaming` itself fails
    Fail(String),
    /// Stream these tokens, then report a stream error
    StreamError {
        /// Tokens sent before the error
        tokens: Vec<String>,
        /// Error message
        error: String,
    },
    /// Send these tokens, then go silent without closing the stream
    Stall(Vec<String>),
}

impl ScriptedReply {
    /// Stream `text` split into small tokens
    pub fn text(text: impl AsRef<str>) -> Self {
        Self::Tokens(split_tokens(text.as_ref()))
    }
}

fn split_tokens(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(TOKEN_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

/// Deterministic backend driven by a queue of replies
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
    batch_reply: Arc<Mutex<Result<String, String>>>,
    token_delay: Duration,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Backend with no scripted replies; unscripted calls answer "Okay."
    #[must_use]
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            batch_reply: Arc::new(Mutex::new(Err("no batch reply scripted".to_string()))),
            token_delay: Duration::ZERO,
        }
    }

    /// Queue a streaming reply
    #[must_use]
    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.push_reply(reply);
        self
    }

    /// Set the result of non-streaming `send` calls
    #[must_use]
    pub fn with_batch_reply(self, reply: Result<String, String>) -> Self {
        *self.batch_reply.lock() = reply;
        self
    }

    /// Pause between streamed tokens
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Queue a streaming reply on a shared backend
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    /// Replies not consumed yet
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    /// Every request received, in order (streaming and batch)
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

fn usage_for(request: &LlmRequest, output_tokens: usize) -> TokenUsage {
    let prompt_chars: usize = request.messages.iter().map(|t| t.content.len()).sum::<usize>()
        + request.system.as_ref().map_or(0, String::len);
    TokenUsage {
        input_tokens: (prompt_chars / 4) as u64,
        output_tokens: output_tokens as u64,
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.requests.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text("Okay."));

        let (tokens, ending) = match reply {
            ScriptedReply::Fail(error) => anyhow::bail!(error),
            ScriptedReply::Tokens(tokens) => (tokens, None),
            ScriptedReply::StreamError { tokens, error } => (tokens, Some(Some(error))),
            ScriptedReply::Stall(tokens) => (tokens, Some(None)),
        };

        let usage = usage_for(request, tokens.len());
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut message = String::new();
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                message.push_str(&token);
                if tx.send(StreamingToken::Token(token)).await.is_err() {
                    return;
                }
            }
            match ending {
                None => {
                    let _ = tx
                        .send(StreamingToken::Complete {
                            message,
                            usage: Some(usage),
                        })
                        .await;
                }
                Some(Some(error)) => {
                    let _ = tx.send(StreamingToken::Error(error)).await;
                }
                // keep the stream open until the consumer gives up
                Some(None) => tx.closed().await,
            }
        });
        Ok(rx)
    }

    async fn send(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        self.requests.lock().push(request.clone());
        let reply = self.batch_reply.lock().clone();
        match reply {
            Ok(content) => Ok(LlmResponse {
                usage: Some(usage_for(request, split_tokens(&content).len())),
                content,
                model: request.model.clone(),
                duration_ms: Some(0),
            }),
            Err(error) => anyhow::bail!(error),
        }
    }
}
