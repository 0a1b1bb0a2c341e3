//! Coauthor Core - Headless Co-Authoring Agent
//!
//! This crate holds everything a streaming writing agent needs to chat with a
//! user while editing a shared document, independent of how clients connect.
//! The daemon crate puts it behind a Unix socket; tests drive it directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Clients (editor plugin, web, CLI)                │
//! │          ClientMessage (up)          ServerMessage (down)        │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┼───────────────────────────────────┐
//! │                       COAUTHOR CORE                              │
//! │  ┌───────────────────────────┴────────────────────────────────┐  │
//! │  │                        Conductor                           │  │
//! │  │  ┌──────────┐  ┌────────────┐  ┌──────────┐  ┌──────────┐  │  │
//! │  │  │ Session  │  │  Stream    │  │   Edit   │  │ Greeting │  │  │
//! │  │  │ Registry │  │ Classifier │  │  Engine  │  │  Cache   │  │  │
//! │  │  └──────────┘  └────────────┘  └────┬─────┘  └──────────┘  │  │
//! │  └─────────────────────────────────────┼──────────────────────┘  │
//! │                LlmBackend        SharedText + cursor presence    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Conductor`]: Orchestrates sessions, the model and documents
//! - [`SessionRegistry`]: Sessions that outlive client connections
//! - [`StreamClassifier`]: Splits chat text from structured edit blocks
//! - [`EditEngine`]: Applies anchored edits with a visible typing cursor
//! - [`GreetingCache`]: Pooled opening messages per persona
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use coauthor_core::{
//!     backend::OllamaBackend, document::MemoryDocuments, events::Handshake,
//!     CoauthorConfig, Conductor,
//! };
//! use tokio::sync::mpsc;
//!
//! let conductor = Arc::new(Conductor::new(
//!     OllamaBackend::from_env(),
//!     Arc::new(MemoryDocuments::new()),
//!     CoauthorConfig::default(),
//! ));
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let session = conductor.connect(Handshake::for_session("chat-1"), tx).await;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: LLM backend abstraction (Ollama, scripted)
//! - [`cancel`]: Cooperative cancellation flag
//! - [`conductor`]: Main Conductor struct
//! - [`config`]: TOML, environment and CLI configuration
//! - [`document`]: Anchored edits, shared text and cursor presence
//! - [`events`]: Messages from clients to the Conductor
//! - [`greeting`]: Greeting pools
//! - [`messages`]: Messages from the Conductor to clients
//! - [`security`]: Input limits
//! - [`session`]: Chat history
//! - [`session_registry`]: Session lifecycle, replay and transfer
//! - [`streaming`]: Chat/edit-block stream classification
//! - [`transport`]: Frame codec and socket defaults
//!
//! # No Transport Dependencies
//!
//! Nothing here opens a socket. Clients reach the Conductor through whatever
//! transport embeds it.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cancel;
pub mod conductor;
pub mod config;
pub mod document;
pub mod events;
pub mod greeting;
pub mod messages;
pub mod security;
pub mod session;
pub mod session_registry;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use backend::{LlmBackend, LlmRequest, LlmResponse, OllamaBackend, StreamingToken, TokenUsage};
pub use cancel::CancelFlag;
pub use conductor::{Conductor, GenerationError, ACTION_LIMIT_NOTICE};
pub use events::{ClientMessage, EnvelopeError, Handshake};
pub use messages::{EditOutcome, HistoryEntry, MessageId, MessageRole, RoomId, ServerMessage, SessionId};
pub use security::{InputLimits, InputValidator, ValidationResult};
pub use session::{ChatHistory, ConversationMessage};

// Document exports
pub use document::{
    DocumentStore, EditAction, EditEngine, EditOperation, EditResult, MemoryDocuments, SharedText,
    TypingConfig,
};

// Streaming exports
pub use streaming::{GenerationState, ParsedResponse, StreamClassifier, StructuredPayload};

// Session registry exports
pub use session_registry::{
    ClientSink, Delivery, GenerationTicket, QueueOverflowPolicy, RegistryConfig, RegistryError,
    RegistrySummary, SessionRegistry, SessionSnapshot,
};

// Greeting exports
pub use greeting::{GreetingCache, GreetingKey, GreetingPool};

// Transport exports
pub use transport::{ConnectionId, FrameDecoder, FrameError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, CoauthorConfig, CoauthorToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
