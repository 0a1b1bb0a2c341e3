//! The Conductor
//!
//! Ties the pieces together: sessions from the registry, prompts for the
//! backend, the stream classifier between model and client, and the edit
//! engine between model and document.
//!
//! # Design Philosophy
//!
//! A client connection is only a window onto a session. Everything a
//! generation produces goes through the session registry, so a generation
//! started on one connection finishes in the background and its events reach
//! whichever connection attaches next.
//!
//! # Architecture
//!
//! ```text
//! ClientMessage ──▶ handle_client_message ──▶ begin_generation (one per session)
//!                                                    │
//!                                      spawned generation task
//!                                                    │
//!        ┌──────── pass 1..=max_iterations ──────────┤
//!        │  build prompt (history, idea, document)   │
//!        │  stream tokens ──▶ classifier ──▶ text_chunk
//!        │  payload ──▶ edit engine / idea draft     │
//!        │  failed edits? feed back and go again     │
//!        └───────────────────────────────────────────┘
//!                                                    │
//!                                           message_complete
//! ```
//!
//! # Thread Safety
//!
//! The Conductor is shared behind an `Arc`. All mutable state lives in the
//! registry, the input validator and the document store, each of which does
//! its own locking.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::{ChatTurn, LlmBackend, LlmRequest, StreamingToken, TokenUsage};
use crate::config::CoauthorConfig;
use crate::document::{DocumentStore, EditEngine, EditResult};
use crate::events::{ClientMessage, Handshake};
use crate::greeting::GreetingCache;
use crate::messages::{EditOutcome, MessageId, MessageRole, RoomId, ServerMessage, SessionId};
use crate::security::{InputValidator, ValidationResult};
use crate::session_registry::{ClientSink, GenerationTicket, RegistryError, SessionRegistry};
use crate::streaming::{ParsedResponse, StreamClassifier, StructuredPayload};

/// Appended to the reply when edits still fail on the last pass
pub const ACTION_LIMIT_NOTICE: &str = "I reached my action limit for this message, so some edits were not applied. \
     Let me know if you want me to try again.";

/// How often a waiting generation checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Errors
// =============================================================================

/// Why a generation ended early
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The model call failed or the stream reported an error
    #[error("model backend error: {0}")]
    Backend(String),

    /// No token arrived within the idle timeout
    #[error("no response from the model for {0:?}")]
    TokenIdle(Duration),

    /// The whole generation ran past its deadline
    #[error("generation exceeded {0:?}")]
    Deadline(Duration),
}

impl GenerationError {
    /// Error code sent to the client
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::TokenIdle(_) | Self::Deadline(_) => "timeout",
        }
    }
}

// =============================================================================
// Conductor
// =============================================================================

/// One model pass, as far as it got
struct PassOutput {
    /// Raw model output
    raw: String,
    /// Chat text and payload split out of `raw`
    parsed: ParsedResponse,
    usage: Option<TokenUsage>,
    cancelled: bool,
}

/// Per-generation inputs fixed when the message arrives
struct Turn {
    message_id: MessageId,
    room: RoomId,
    context: Option<String>,
}

/// Orchestrates conversations between clients, the model and documents
pub struct Conductor<B: LlmBackend> {
    config: Arc<CoauthorConfig>,
    backend: Arc<B>,
    registry: SessionRegistry,
    engine: Arc<EditEngine>,
    greetings: Arc<GreetingCache>,
    classifier: StreamClassifier,
    validator: Arc<InputValidator>,
}

impl<B: LlmBackend + 'static> Conductor<B> {
    /// Create a Conductor editing documents from `documents`
    pub fn new(backend: B, documents: Arc<dyn DocumentStore>, config: CoauthorConfig) -> Self {
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn LlmBackend> = backend.clone();
        let greetings = GreetingCache::new(
            dyn_backend,
            config.agent.model.clone(),
            config.agent.system_prompt.clone(),
            config.greeting_pool_size,
        );

        tracing::info!(
            backend = backend.name(),
            model = %config.agent.model,
            max_iterations = config.agent.max_iterations,
            "Conductor created"
        );

        Self {
            registry: SessionRegistry::new(config.sessions.clone()),
            engine: Arc::new(EditEngine::new(documents, config.typing.clone())),
            greetings: Arc::new(greetings),
            classifier: StreamClassifier::default(),
            validator: Arc::new(InputValidator::new(config.limits.clone())),
            config: Arc::new(config),
            backend,
        }
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Edit engine
    #[must_use]
    pub fn engine(&self) -> &EditEngine {
        &self.engine
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CoauthorConfig {
        &self.config
    }

    /// Greeting cache
    #[must_use]
    pub fn greetings(&self) -> &GreetingCache {
        &self.greetings
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Attach a client to its session
    ///
    /// Queued events are replayed first. A session with history then gets
    /// that history; a fresh one gets a greeting.
    pub async fn connect(&self, handshake: Handshake, sink: ClientSink) -> SessionId {
        let session_id = handshake.session_id.unwrap_or_else(SessionId::anonymous);
        let transferred = self
            .registry
            .register(&session_id, sink, handshake.transfer_from.as_ref());

        let display_name = handshake.display_name;
        let (history, name) = self
            .registry
            .with_data(&session_id, |data| {
                if display_name.is_some() {
                    data.display_name = display_name;
                }
                if let Some(room) = handshake.room_ref {
                    data.room = Some(room);
                }
                (data.history.entries(), data.display_name.clone())
            })
            .unwrap_or_default();

        tracing::info!(
            session_id = %session_id,
            transferred,
            history = history.len(),
            "Client connected"
        );

        if history.is_empty() {
            let key = self.greetings.key_for(name.as_deref());
            let content = self.greetings.get(&key).await;
            self.registry
                .emit(&session_id, ServerMessage::Greeting { content });
        } else {
            self.registry
                .emit(&session_id, ServerMessage::History { messages: history });
        }
        session_id
    }

    /// Detach whatever client is attached; generations keep running
    pub fn disconnect(&self, session_id: &SessionId) {
        self.registry.unregister(session_id);
        tracing::info!(session_id = %session_id, "Client disconnected");
    }

    /// Detach `sink` only if it is still the attached client
    pub fn disconnect_sink(&self, session_id: &SessionId, sink: &ClientSink) {
        self.registry.unregister_sink(session_id, sink);
        tracing::debug!(session_id = %session_id, "Connection closed");
    }

    // =========================================================================
    // Client Messages
    // =========================================================================

    /// Handle one message from a client
    pub async fn handle_client_message(self: &Arc<Self>, session_id: &SessionId, message: ClientMessage) {
        if let Err(e) = message.validate() {
            tracing::warn!(session_id = %session_id, kind = message.kind(), error = %e, "Invalid client message");
            self.registry
                .emit(session_id, ServerMessage::error("invalid_message", e.to_string()));
            return;
        }

        match message {
            ClientMessage::Message {
                content,
                context,
                room_ref,
            } => self.start_generation(session_id, content, context, room_ref),
            ClientMessage::Cancel => {
                let cancelled = self.registry.cancel(session_id);
                tracing::info!(session_id = %session_id, cancelled, "Cancel requested");
            }
            ClientMessage::ClearHistory => self.clear_history(session_id).await,
            ClientMessage::IdeaUpdate { content, room_ref } => {
                self.registry.ensure_session(session_id);
                self.registry.with_data(session_id, |data| {
                    data.idea_context = Some(content);
                    if let Some(room) = room_ref {
                        data.room = Some(room);
                    }
                });
                tracing::debug!(session_id = %session_id, "Idea context updated");
            }
        }
    }

    fn start_generation(
        self: &Arc<Self>,
        session_id: &SessionId,
        content: String,
        context: Option<String>,
        room_ref: Option<RoomId>,
    ) {
        if !self.accept(session_id, &self.validator.validate_message(&content)) {
            return;
        }

        let ticket = match self.registry.begin_generation(session_id) {
            Ok(ticket) => ticket,
            Err(e @ RegistryError::GenerationInProgress(_)) => {
                tracing::info!(session_id = %session_id, "Message rejected, generation running");
                self.registry.emit(session_id, ServerMessage::error("busy", e.to_string()));
                return;
            }
        };

        // Only messages that would actually run count toward the rate limit
        if !self.accept(session_id, &self.validator.check_rate_limit(session_id)) {
            drop(ticket);
            return;
        }

        let room = ticket.with_data(|data| {
            data.history.add_user_message(content);
            if let Some(room) = room_ref {
                data.room = Some(room);
            }
            data.room
                .clone()
                .unwrap_or_else(|| RoomId::new(session_id.as_str()))
        });

        let turn = Turn {
            message_id: MessageId::new(),
            room,
            context,
        };
        let span = tracing::info_span!(
            "generation",
            session_id = %session_id,
            message_id = %turn.message_id
        );
        let conductor = Arc::clone(self);
        tokio::spawn(async move { conductor.run_generation(ticket, turn).await }.instrument(span));
    }

    /// Report a rejected message to the client; true if it passed
    fn accept(&self, session_id: &SessionId, validation: &ValidationResult) -> bool {
        if validation.is_valid() {
            return true;
        }
        let code = validation.error_code().unwrap_or("invalid_message");
        let reason = validation.error_message().unwrap_or("invalid message").to_string();
        tracing::warn!(session_id = %session_id, code, reason = %reason, "Message rejected");
        self.registry.emit(session_id, ServerMessage::error(code, reason));
        false
    }

    async fn clear_history(&self, session_id: &SessionId) {
        // The user and their document stay the same; only the conversation goes
        let kept = self
            .registry
            .with_data(session_id, |data| (data.display_name.clone(), data.room.clone()));
        let sink = self.registry.clear(session_id);
        self.validator.forget(session_id);

        if let Some(sink) = sink {
            self.registry.register(session_id, sink, None);
            let (name, room) = kept.unwrap_or_default();
            self.registry.with_data(session_id, |data| {
                data.display_name = name.clone();
                data.room = room;
            });
            self.registry
                .emit(session_id, ServerMessage::History { messages: Vec::new() });
            let key = self.greetings.key_for(name.as_deref());
            let content = self.greetings.get(&key).await;
            self.registry
                .emit(session_id, ServerMessage::Greeting { content });
        }
        tracing::info!(session_id = %session_id, "History cleared");
    }

    // =========================================================================
    // Generation
    // =========================================================================

    async fn run_generation(self: Arc<Self>, ticket: GenerationTicket, turn: Turn) {
        let deadline = self.config.generation.generation_timeout;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(deadline, self.generate(&ticket, &turn)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Deadline(deadline)),
        };

        if let Err(e) = outcome {
            tracing::warn!(error = %e, code = e.code(), "Generation failed");
            ticket.emit(ServerMessage::error(e.code(), e.to_string()));
        }

        self.engine.clear_cursor(&turn.room);
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Generation finished");
        ticket.finish();
    }

    async fn generate(&self, ticket: &GenerationTicket, turn: &Turn) -> Result<(), GenerationError> {
        let max_iterations = self.config.agent.max_iterations.max(1);
        let mut chat_parts: Vec<String> = Vec::new();
        let mut extra_turns: Vec<ChatTurn> = Vec::new();

        for iteration in 1..=max_iterations {
            let status = if iteration == 1 {
                "thinking"
            } else {
                "retrying failed edits"
            };
            ticket.emit(ServerMessage::AgentProgress {
                iteration,
                max_iterations,
                status: status.to_string(),
            });

            let request = self.build_request(ticket, turn, &extra_turns);
            let pass = self
                .stream_pass(ticket, request, &turn.message_id, !chat_parts.is_empty())
                .await?;

            if let Some(usage) = pass.usage {
                ticket.emit(ServerMessage::TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
            let chat = pass.parsed.chat_text.trim();
            if !chat.is_empty() {
                chat_parts.push(chat.to_string());
            }
            if pass.cancelled {
                break;
            }

            match pass.parsed.payload {
                Some(StructuredPayload::Edits(mut ops)) => {
                    self.validator.cap_edits(&mut ops);
                    ticket.emit(ServerMessage::DocumentEditStart {
                        room_ref: turn.room.clone(),
                        edit_count: ops.len(),
                    });
                    let results = self
                        .engine
                        .apply_edits_with_cancel(&turn.room, &ops, ticket.cancel_flag())
                        .await;
                    self.engine.clear_cursor(&turn.room);
                    ticket.emit(ServerMessage::DocumentEditEnd {
                        room_ref: turn.room.clone(),
                        results: results.iter().map(EditOutcome::from).collect(),
                    });

                    let failed = results.iter().filter(|r| !r.success).count();
                    if failed == 0 || ticket.is_cancelled() {
                        break;
                    }
                    if iteration == max_iterations {
                        tracing::warn!(failed, iteration, "Edits still failing at iteration limit");
                        self.emit_chat(ticket, &turn.message_id, ACTION_LIMIT_NOTICE, !chat_parts.is_empty());
                        chat_parts.push(ACTION_LIMIT_NOTICE.to_string());
                        break;
                    }

                    tracing::info!(failed, iteration, "Feeding failed edits back to the model");
                    extra_turns.push(ChatTurn::new(MessageRole::Assistant, pass.raw));
                    extra_turns.push(ChatTurn::new(MessageRole::User, edit_feedback(&results)));
                }
                Some(StructuredPayload::Idea(draft)) => {
                    ticket.emit(ServerMessage::DocumentEditStart {
                        room_ref: turn.room.clone(),
                        edit_count: 1,
                    });
                    let result = self
                        .engine
                        .write_draft(&turn.room, &draft.document_text(), ticket.cancel_flag())
                        .await;
                    self.engine.clear_cursor(&turn.room);
                    ticket.emit(ServerMessage::DocumentEditEnd {
                        room_ref: turn.room.clone(),
                        results: vec![EditOutcome::from(&result)],
                    });

                    if !draft.open_questions.is_empty() {
                        ticket.emit(ServerMessage::OpenQuestions {
                            questions: draft.open_questions,
                        });
                    }
                    if !draft.suggested_responses.is_empty() {
                        ticket.emit(ServerMessage::SuggestedResponses {
                            responses: draft.suggested_responses,
                        });
                    }
                    break;
                }
                None => break,
            }
        }

        let content = chat_parts.join("\n\n");
        if !ticket.is_current() {
            tracing::info!(message_id = %turn.message_id, "Generation superseded, reply not recorded");
            return Ok(());
        }
        ticket.with_data(|data| {
            data.history
                .add_assistant_message(turn.message_id.clone(), content.clone());
        });
        ticket.emit(ServerMessage::MessageComplete {
            message_id: turn.message_id.clone(),
            content,
        });
        Ok(())
    }

    /// Prompt for one pass: system prompt with session context, then history
    fn build_request(&self, ticket: &GenerationTicket, turn: &Turn, extra_turns: &[ChatTurn]) -> LlmRequest {
        let (turns, idea) = ticket.with_data(|data| (data.history.turns(), data.idea_context.clone()));

        let mut system = self.config.agent.system_prompt.clone();
        if let Some(idea) = idea.filter(|i| !i.trim().is_empty()) {
            system.push_str("\n\n## The user's idea\n");
            system.push_str(&idea);
        }
        let document = self.engine.document_text(&turn.room);
        if document.is_empty() {
            system.push_str("\n\n## Current document\nThe document is empty.");
        } else {
            system.push_str("\n\n## Current document\n");
            system.push_str(&document);
        }
        if let Some(context) = turn.context.as_deref().filter(|c| !c.trim().is_empty()) {
            system.push_str("\n\n## Additional context\n");
            system.push_str(context);
        }

        let mut request = LlmRequest::chat(&self.config.agent.model)
            .with_system(system)
            .with_temperature(self.config.agent.temperature)
            .with_stream(true);
        request.messages = turns;
        request.messages.extend_from_slice(extra_turns);
        request
    }

    /// Stream one model pass to the client
    async fn stream_pass(
        &self,
        ticket: &GenerationTicket,
        request: LlmRequest,
        message_id: &MessageId,
        mut needs_separator: bool,
    ) -> Result<PassOutput, GenerationError> {
        let mut rx = self
            .backend
            .send_streaming(&request)
            .await
            .map_err(|e| GenerationError::Backend(format!("{e:#}")))?;

        let idle_timeout = self.config.generation.token_idle_timeout;
        let mut state = self.classifier.begin();
        let mut last_token = Instant::now();
        let mut usage = None;

        let raw = loop {
            if ticket.is_cancelled() {
                let streamed: String = state.accumulated().chars().take(state.streamed_len()).collect();
                tracing::info!(streamed_chars = state.streamed_len(), "Generation cancelled mid-stream");
                return Ok(PassOutput {
                    raw: state.accumulated().to_string(),
                    parsed: ParsedResponse {
                        chat_text: streamed,
                        payload: None,
                        remainder: String::new(),
                    },
                    usage,
                    cancelled: true,
                });
            }

            match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
                Err(_) => {
                    if last_token.elapsed() >= idle_timeout {
                        return Err(GenerationError::TokenIdle(idle_timeout));
                    }
                }
                Ok(Some(StreamingToken::Token(token))) => {
                    last_token = Instant::now();
                    let classified = state.push(&token);
                    if self.emit_chat(ticket, message_id, &classified.fragment, needs_separator) {
                        needs_separator = false;
                    }
                }
                Ok(Some(StreamingToken::Complete { message, usage: reported })) => {
                    usage = reported;
                    if state.accumulated().is_empty() {
                        break message;
                    }
                    break state.accumulated().to_string();
                }
                Ok(Some(StreamingToken::Error(e))) => return Err(GenerationError::Backend(e)),
                Ok(None) => {
                    tracing::debug!("Token stream closed without completion");
                    break state.accumulated().to_string();
                }
            }
        };

        let parsed = state.finish(&raw);
        self.emit_chat(ticket, message_id, &parsed.remainder, needs_separator);
        Ok(PassOutput {
            raw,
            parsed,
            usage,
            cancelled: false,
        })
    }

    /// Emit a chat fragment, separating it from an earlier pass's text
    ///
    /// Returns whether anything was emitted.
    fn emit_chat(&self, ticket: &GenerationTicket, message_id: &MessageId, text: &str, separate: bool) -> bool {
        if text.is_empty() {
            return false;
        }
        let text = if separate {
            format!("\n\n{}", text.trim_start())
        } else {
            text.to_string()
        };
        ticket.emit(ServerMessage::TextChunk {
            message_id: message_id.clone(),
            text,
        });
        true
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Periodically drop detached sessions idle past the session timeout
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let conductor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = conductor.registry.cleanup_expired();
                if removed > 0 {
                    tracing::info!(removed, remaining = conductor.registry.count(), "Expired sessions removed");
                }
            }
        })
    }
}

impl<B: LlmBackend> fmt::Debug for Conductor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conductor")
            .field("backend", &self.backend.name())
            .field("model", &self.config.agent.model)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Feedback turn listing the edits that failed
fn edit_feedback(results: &[EditResult]) -> String {
    let mut feedback = String::from("Some of your edits could not be applied:\n");
    for (i, result) in results.iter().enumerate().filter(|(_, r)| !r.success) {
        feedback.push_str(&format!(
            "- edit {} ({}): {}\n",
            i + 1,
            result.action,
            result.error.as_deref().unwrap_or("failed")
        ));
    }
    feedback.push_str(
        "\nThe edits that succeeded are already in the document shown above. \
         Send a new [[EDITS]] block with only the failed edits, copying anchors \
         exactly from the current document.",
    );
    feedback
}
