//! Ollama Backend Implementation
//!
//! LLM backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (NDJSON when streaming)
//! - `/api/tags` - List available models (used as the health probe)
//!
//! The final NDJSON line carries `done: true` plus `prompt_eval_count` and
//! `eval_count`, which are reported as token usage.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::traits::{LlmBackend, LlmRequest, LlmResponse, StreamingToken, TokenUsage};

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    /// Create from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self::new(host, port)
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Build the JSON body for `/api/chat`
    fn build_body(request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for turn in &request.messages {
            messages.push(serde_json::json!(turn));
        }

        let mut options = serde_json::Map::new();
        options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));
        }

        serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }

    async fn post_chat(&self, request: &LlmRequest, stream: bool) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http_client
            .post(self.chat_url())
            .json(&Self::build_body(request, stream))
            .send()
            .await
            .with_context(|| format!("Failed to reach Ollama at {}", self.base_url()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }
        Ok(response)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

/// One NDJSON line from `/api/chat`
#[derive(Debug, Default, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

impl ChatLine {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: self.prompt_eval_count.unwrap_or(0),
            output_tokens: self.eval_count.unwrap_or(0),
        })
    }

    fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);
        let response = self.post_chat(request, true).await?;
        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Parse newline-delimited JSON
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(data) = serde_json::from_str::<ChatLine>(line) else {
                        tracing::debug!(line, "Skipping unparseable Ollama line");
                        continue;
                    };

                    if let Some(error) = data.error {
                        let _ = tx.send(StreamingToken::Error(error)).await;
                        return;
                    }

                    let token = data.content();
                    if !token.is_empty() {
                        full_response.push_str(token);
                        if tx.send(StreamingToken::Token(token.to_string())).await.is_err() {
                            // Receiver dropped, stop streaming
                            return;
                        }
                    }

                    if data.done {
                        let _ = tx
                            .send(StreamingToken::Complete {
                                usage: data.usage(),
                                message: full_response,
                            })
                            .await;
                        return;
                    }
                }
            }

            // Stream ended without done signal
            if full_response.is_empty() {
                let _ = tx
                    .send(StreamingToken::Error("Ollama closed the stream without a response".to_string()))
                    .await;
            } else {
                let _ = tx
                    .send(StreamingToken::Complete {
                        message: full_response,
                        usage: None,
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    async fn send(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let start = Instant::now();
        let response = self.post_chat(request, false).await?;
        let data: ChatLine = response
            .json()
            .await
            .context("Ollama returned an unexpected response body")?;

        if let Some(error) = data.error {
            anyhow::bail!("Ollama error: {error}");
        }

        Ok(LlmResponse {
            content: data.content().to_string(),
            model: request.model.clone(),
            usage: data.usage(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
        })
    }
}
