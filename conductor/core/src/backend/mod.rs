//! LLM Backend Integration
//!
//! This module provides abstracted access to LLM backends through a common
//! trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//! - **Scripted**: Deterministic replies for tests and demos
//!
//! # Usage
//!
//! ```ignore
//! use coauthor_core::backend::{OllamaBackend, LlmBackend, LlmRequest};
//!
//! let backend = OllamaBackend::from_env();
//! let request = LlmRequest::new("Hello!", "llama3");
//! let rx = backend.send_streaming(&request).await?;
//! ```

mod ollama;
mod scripted;
mod traits;

pub use ollama::OllamaBackend;
pub use scripted::{ScriptedBackend, ScriptedReply};
pub use traits::{ChatTurn, LlmBackend, LlmRequest, LlmResponse, StreamingToken, TokenUsage};
