//! Session Registry - Decoupling Clients From Agent Work
//!
//! A session is the logical conversation a client attaches to. Clients come
//! and go (tab reloads, flaky networks, sign-in turning an anonymous chat
//! into a durable one); generations keep running regardless. The registry
//! lets the Conductor:
//!
//! - Attach and detach a client's delivery channel without touching work
//! - Deliver events immediately when attached, queue them otherwise
//! - Replay queued events, in order and exactly once, on the next attach
//! - Enforce at most one running generation per session
//! - Move a session (queue, history, running generation) to a new ID
//!
//! # Architecture
//!
//! ```text
//!                      SessionRegistry
//!                     ┌──────────────────────────────────────────┐
//!                     │ HashMap<SessionId, Arc<SessionSlot>>     │
//!                     │   - wrapped in Arc<RwLock<>>             │
//!                     └───────────────┬──────────────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │ SessionSlot │       │ SessionSlot  │       │ SessionSlot  │
//!       │ sink: Some  │       │ sink: None   │       │ sink: Some   │
//!       │ queue: []   │       │ queue: [..]  │       │ running      │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//!                                                       ▲
//!                                   GenerationTicket ───┘ (emits, then marks idle)
//! ```
//!
//! # Thread Safety
//!
//! The map lock is held only for lookups and membership changes. All
//! per-session state lives behind the slot's own mutex, so sessions never
//! contend with each other. A generation holds an `Arc` to its slot rather
//! than a session ID; re-keying a slot on transfer therefore carries
//! in-flight generations along with it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cancel::CancelFlag;
use crate::messages::{RoomId, ServerMessage, SessionId};
use crate::session::ChatHistory;

/// Channel a connected client receives messages on
pub type ClientSink = mpsc::UnboundedSender<ServerMessage>;

/// What to do when a detached session's replay queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflowPolicy {
    /// Discard the oldest queued event to make room (default)
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum events queued for a detached session
    pub max_queued_events: usize,
    /// Overflow behaviour for the replay queue
    pub overflow_policy: QueueOverflowPolicy,
    /// Detached, idle sessions older than this are removed by cleanup
    pub session_timeout: Duration,
    /// Messages kept in each session's history (0 = unlimited)
    pub max_history_messages: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_queued_events: 1000,
            overflow_policy: QueueOverflowPolicy::DropOldest,
            session_timeout: Duration::from_secs(60 * 60),
            max_history_messages: 200,
        }
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The session already has a running generation
    #[error("a generation is already running for session {0}")]
    GenerationInProgress(SessionId),
}

/// How an emitted event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the attached client
    Sent,
    /// Stored for replay on the next attach
    Queued,
    /// Dropped (session cleared or unknown, or queue full with `DropNewest`)
    Discarded,
}

/// Conversation data owned by a session
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    /// Chat history
    pub history: ChatHistory,
    /// Latest idea description from the client
    pub idea_context: Option<String>,
    /// Room the session edits by default
    pub room: Option<RoomId>,
    /// Name to greet the user by
    pub display_name: Option<String>,
}

#[derive(Debug)]
struct SessionState {
    id: SessionId,
    data: SessionData,
    sink: Option<ClientSink>,
    queue: VecDeque<ServerMessage>,
    dropped_events: u64,
    active_generation: Option<u64>,
    cancel: CancelFlag,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    /// Set when the session was merged into another on transfer
    merged_into: Option<Arc<SessionSlot>>,
    /// Set when the session was destroyed
    cleared: bool,
}

impl SessionState {
    fn deliver(&mut self, message: ServerMessage, config: &RegistryConfig) -> Delivery {
        if self.cleared {
            return Delivery::Discarded;
        }
        self.last_activity = Utc::now();

        let Some(sink) = &self.sink else {
            return self.enqueue(message, config);
        };
        match sink.send(message) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::SendError(message)) => {
                tracing::info!(session_id = %self.id, "Client channel closed, detaching");
                self.sink = None;
                self.enqueue(message, config)
            }
        }
    }

    fn enqueue(&mut self, message: ServerMessage, config: &RegistryConfig) -> Delivery {
        if self.queue.len() < config.max_queued_events {
            self.queue.push_back(message);
            return Delivery::Queued;
        }

        self.dropped_events += 1;
        tracing::warn!(
            session_id = %self.id,
            queued = self.queue.len(),
            dropped = self.dropped_events,
            policy = ?config.overflow_policy,
            "Replay queue full"
        );
        match config.overflow_policy {
            QueueOverflowPolicy::DropOldest if config.max_queued_events > 0 => {
                self.queue.pop_front();
                self.queue.push_back(message);
                Delivery::Queued
            }
            QueueOverflowPolicy::DropOldest | QueueOverflowPolicy::DropNewest => Delivery::Discarded,
        }
    }

    fn trim_queue(&mut self, config: &RegistryConfig) {
        while self.queue.len() > config.max_queued_events {
            match config.overflow_policy {
                QueueOverflowPolicy::DropOldest => self.queue.pop_front(),
                QueueOverflowPolicy::DropNewest => self.queue.pop_back(),
            };
            self.dropped_events += 1;
        }
    }
}

/// One session's state behind its own lock
pub struct SessionSlot {
    state: Mutex<SessionState>,
    config: Arc<RegistryConfig>,
}

impl SessionSlot {
    fn new(id: SessionId, config: Arc<RegistryConfig>) -> Self {
        let history = ChatHistory::new(config.max_history_messages);
        Self {
            state: Mutex::new(SessionState {
                id,
                data: SessionData {
                    history,
                    ..SessionData::default()
                },
                sink: None,
                queue: VecDeque::new(),
                dropped_events: 0,
                active_generation: None,
                cancel: CancelFlag::new(),
                started_at: None,
                finished_at: None,
                last_activity: Utc::now(),
                merged_into: None,
                cleared: false,
            }),
            config,
        }
    }

    fn emit(self: &Arc<Self>, message: ServerMessage) -> Delivery {
        let config = Arc::clone(&self.config);
        self.with_live(|state| state.deliver(message, &config))
    }

    /// Run `f` on the state a session's events currently land in
    ///
    /// Follows merge forwarding so a generation started under an old ID
    /// keeps reaching its session after a transfer.
    fn with_live<R>(self: &Arc<Self>, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut current = Arc::clone(self);
        loop {
            let mut state = current.state.lock();
            if let Some(next) = state.merged_into.clone() {
                drop(state);
                current = next;
                continue;
            }
            return f(&mut state);
        }
    }
}

impl fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionSlot")
            .field("id", &state.id)
            .field("attached", &state.sink.is_some())
            .field("queued", &state.queue.len())
            .field("running", &state.active_generation.is_some())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session ID
    pub id: SessionId,
    /// Whether a client is attached
    pub attached: bool,
    /// Events waiting for replay
    pub queued_events: usize,
    /// Events lost to queue overflow
    pub dropped_events: u64,
    /// Whether a generation is running
    pub running: bool,
    /// When the current or last generation started
    pub started_at: Option<DateTime<Utc>>,
    /// When the last generation finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Last attach, detach or event
    pub last_activity: DateTime<Utc>,
    /// Messages in history
    pub history_len: usize,
    /// Default room
    pub room: Option<RoomId>,
}

/// Summary of all sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Total sessions
    pub total_sessions: usize,
    /// Sessions with an attached client
    pub attached: usize,
    /// Sessions with a running generation
    pub running: usize,
    /// Events waiting for replay across all sessions
    pub queued_events: usize,
    /// Events lost to queue overflow across all sessions
    pub dropped_events: u64,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Proof that a session is running a generation
///
/// Dropping the ticket (or calling [`finish`](Self::finish)) marks the
/// session idle and stamps `finished_at`, so a panicking or early-returning
/// generation task can never leave a session stuck busy.
#[derive(Debug)]
pub struct GenerationTicket {
    slot: Arc<SessionSlot>,
    generation: u64,
    cancel: CancelFlag,
    finished: bool,
}

impl GenerationTicket {
    /// Deliver or queue an event for this generation's session
    ///
    /// Discarded once the session no longer runs this generation, e.g.
    /// after a merge into a session that was already busy.
    pub fn emit(&self, message: ServerMessage) -> Delivery {
        let config = Arc::clone(&self.slot.config);
        let generation = self.generation;
        self.slot.with_live(|state| {
            if state.active_generation == Some(generation) {
                state.deliver(message, &config)
            } else {
                Delivery::Discarded
            }
        })
    }

    /// Whether the session is still running this generation
    #[must_use]
    pub fn is_current(&self) -> bool {
        let generation = self.generation;
        self.slot
            .with_live(|state| state.active_generation == Some(generation))
    }

    /// Cancellation flag for this generation
    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Whether this generation was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current ID of the session (changes after a transfer)
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.slot.with_live(|state| state.id.clone())
    }

    /// Read or update the session's conversation data
    pub fn with_data<R>(&self, f: impl FnOnce(&mut SessionData) -> R) -> R {
        self.slot.with_live(|state| f(&mut state.data))
    }

    /// Mark the generation finished
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let generation = self.generation;
        self.slot.with_live(|state| {
            if state.active_generation == Some(generation) {
                state.active_generation = None;
                state.finished_at = Some(Utc::now());
                state.last_activity = Utc::now();
                tracing::info!(session_id = %state.id, generation, "Generation finished");
            }
        });
    }
}

impl Drop for GenerationTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Registry of logical sessions
#[derive(Clone)]
pub struct SessionRegistry {
    /// Inner map of session ID to slot
    inner: Arc<RwLock<HashMap<SessionId, Arc<SessionSlot>>>>,
    config: Arc<RegistryConfig>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn slot(&self, id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.inner.read().get(id).cloned()
    }

    fn get_or_create(&self, id: &SessionId) -> Arc<SessionSlot> {
        if let Some(slot) = self.slot(id) {
            return slot;
        }
        let mut inner = self.inner.write();
        Arc::clone(inner.entry(id.clone()).or_insert_with(|| {
            tracing::info!(session_id = %id, "Session created");
            Arc::new(SessionSlot::new(id.clone(), Arc::clone(&self.config)))
        }))
    }

    /// Make sure a session exists without attaching a client
    pub fn ensure_session(&self, session_id: &SessionId) {
        self.get_or_create(session_id);
    }

    /// Attach a client to a session, creating it if needed
    ///
    /// With `transfer_from`, that session's state first moves to
    /// `session_id`: re-keyed if `session_id` is new, merged into it
    /// otherwise. Queued events are replayed to `sink` before this returns,
    /// under the session lock, so nothing emitted concurrently can overtake
    /// them. Returns whether a transfer happened.
    pub fn register(
        &self,
        session_id: &SessionId,
        sink: ClientSink,
        transfer_from: Option<&SessionId>,
    ) -> bool {
        let mut inner = self.inner.write();

        let transferred = match transfer_from.filter(|from| *from != session_id) {
            Some(from) => match inner.remove(from) {
                Some(source) => {
                    match inner.get(session_id) {
                        Some(target) => Self::merge(&source, target),
                        None => {
                            source.state.lock().id = session_id.clone();
                            inner.insert(session_id.clone(), source);
                        }
                    }
                    tracing::info!(from = %from, to = %session_id, "Session transferred");
                    true
                }
                None => {
                    tracing::debug!(from = %from, to = %session_id, "Nothing to transfer");
                    false
                }
            },
            None => false,
        };

        let slot = Arc::clone(inner.entry(session_id.clone()).or_insert_with(|| {
            tracing::info!(session_id = %session_id, "Session created");
            Arc::new(SessionSlot::new(session_id.clone(), Arc::clone(&self.config)))
        }));

        let mut state = slot.state.lock();
        let mut replayed = 0;
        let mut sink_alive = true;
        while let Some(message) = state.queue.pop_front() {
            if let Err(mpsc::error::SendError(message)) = sink.send(message) {
                state.queue.push_front(message);
                sink_alive = false;
                break;
            }
            replayed += 1;
        }

        if sink_alive {
            if state.sink.replace(sink).is_some() {
                tracing::debug!(session_id = %session_id, "Replacing attached client");
            }
        }
        state.last_activity = Utc::now();
        tracing::info!(
            session_id = %session_id,
            replayed,
            attached = sink_alive,
            running = state.active_generation.is_some(),
            "Client attached"
        );
        transferred
    }

    /// Fold `source` into `target`; both locked, source locked first
    fn merge(source: &Arc<SessionSlot>, target: &Arc<SessionSlot>) {
        let mut src = source.state.lock();
        let mut dst = target.state.lock();

        dst.queue.extend(src.queue.drain(..));
        dst.dropped_events += src.dropped_events;
        dst.trim_queue(&target.config);

        if dst.data.history.is_empty() {
            dst.data.history = std::mem::take(&mut src.data.history);
        }
        if dst.data.idea_context.is_none() {
            dst.data.idea_context = src.data.idea_context.take();
        }
        if dst.data.room.is_none() {
            dst.data.room = src.data.room.take();
        }
        if dst.data.display_name.is_none() {
            dst.data.display_name = src.data.display_name.take();
        }

        if src.active_generation.is_some() {
            if dst.active_generation.is_none() {
                dst.active_generation = src.active_generation;
                dst.cancel = src.cancel.clone();
                dst.started_at = src.started_at;
            } else {
                // The target keeps its own generation; the source's stops
                // and its events no longer reach anyone
                src.cancel.cancel();
                tracing::info!(
                    source = %src.id,
                    target = %dst.id,
                    "Both sessions running, cancelled source generation"
                );
            }
        }

        src.sink = None;
        src.merged_into = Some(Arc::clone(target));
    }

    /// Detach the client from a session; any running generation continues
    pub fn unregister(&self, session_id: &SessionId) {
        if let Some(slot) = self.slot(session_id) {
            let mut state = slot.state.lock();
            if state.sink.take().is_some() {
                state.last_activity = Utc::now();
                tracing::info!(
                    session_id = %session_id,
                    running = state.active_generation.is_some(),
                    "Client detached"
                );
            }
        }
    }

    /// Detach `sink` only if it is still the attached client
    ///
    /// Lets an old connection go away without detaching the one that
    /// replaced it.
    pub fn unregister_sink(&self, session_id: &SessionId, sink: &ClientSink) {
        if let Some(slot) = self.slot(session_id) {
            let mut state = slot.state.lock();
            if state.sink.as_ref().is_some_and(|s| s.same_channel(sink)) {
                state.sink = None;
                state.last_activity = Utc::now();
                tracing::info!(session_id = %session_id, "Client detached");
            }
        }
    }

    /// Deliver an event if a client is attached, queue it otherwise
    pub fn emit(&self, session_id: &SessionId, message: ServerMessage) -> Delivery {
        match self.slot(session_id) {
            Some(slot) => slot.emit(message),
            None => {
                tracing::debug!(session_id = %session_id, kind = message.kind(), "Emit to unknown session");
                Delivery::Discarded
            }
        }
    }

    /// Mark a session busy, creating it if needed
    ///
    /// # Errors
    ///
    /// `RegistryError::GenerationInProgress` if a generation is already
    /// running for the session.
    pub fn begin_generation(&self, session_id: &SessionId) -> Result<GenerationTicket, RegistryError> {
        let slot = self.get_or_create(session_id);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
        let cancel = slot.with_live(|state| {
            if state.active_generation.is_some() {
                return Err(RegistryError::GenerationInProgress(state.id.clone()));
            }
            state.active_generation = Some(generation);
            state.cancel = CancelFlag::new();
            state.started_at = Some(Utc::now());
            state.finished_at = None;
            state.last_activity = Utc::now();
            tracing::info!(session_id = %state.id, generation, "Generation started");
            Ok(state.cancel.clone())
        })?;

        Ok(GenerationTicket {
            slot,
            generation,
            cancel,
            finished: false,
        })
    }

    /// Request cancellation of the running generation
    ///
    /// Returns whether a generation was running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let state = slot.state.lock();
        if state.active_generation.is_some() {
            state.cancel.cancel();
            tracing::info!(session_id = %session_id, "Generation cancel requested");
            true
        } else {
            false
        }
    }

    /// Destroy a session, cancelling any running generation
    ///
    /// Returns the attached client, if any, so the caller can re-attach it
    /// to a fresh session.
    pub fn clear(&self, session_id: &SessionId) -> Option<ClientSink> {
        let slot = self.inner.write().remove(session_id)?;
        let mut state = slot.state.lock();
        state.cancel.cancel();
        state.cleared = true;
        state.queue.clear();
        state.data = SessionData::default();
        tracing::info!(session_id = %session_id, "Session cleared");
        state.sink.take()
    }

    /// Read or update a session's conversation data
    pub fn with_data<R>(&self, session_id: &SessionId, f: impl FnOnce(&mut SessionData) -> R) -> Option<R> {
        let slot = self.slot(session_id)?;
        let mut state = slot.state.lock();
        Some(f(&mut state.data))
    }

    /// Point-in-time view of a session
    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock();
        Some(SessionSnapshot {
            id: state.id.clone(),
            attached: state.sink.is_some(),
            queued_events: state.queue.len(),
            dropped_events: state.dropped_events,
            running: state.active_generation.is_some(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            last_activity: state.last_activity,
            history_len: state.data.history.len(),
            room: state.data.room.clone(),
        })
    }

    /// Check if a session exists
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.inner.read().contains_key(session_id)
    }

    /// Get the number of sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Get the IDs of all sessions
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Remove detached, idle sessions inactive for longer than `max_idle`
    ///
    /// Returns the number of sessions removed.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let Ok(max_idle) = chrono::Duration::from_std(max_idle) else {
            return 0;
        };
        let now = Utc::now();
        let mut inner = self.inner.write();
        let before = inner.len();

        inner.retain(|id, slot| {
            let state = slot.state.lock();
            let expired = state.sink.is_none()
                && state.active_generation.is_none()
                && now - state.last_activity > max_idle;
            if expired {
                tracing::info!(session_id = %id, queued = state.queue.len(), "Removing idle session");
            }
            !expired
        });

        let removed = before - inner.len();
        if removed > 0 {
            tracing::info!(removed, remaining = inner.len(), "Cleaned up idle sessions");
        }
        removed
    }

    /// [`cleanup_idle`](Self::cleanup_idle) with the configured session timeout
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_idle(self.config.session_timeout)
    }

    /// Get a summary of all sessions
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        inner.values().fold(
            RegistrySummary {
                total_sessions: inner.len(),
                ..RegistrySummary::default()
            },
            |mut summary, slot| {
                let state = slot.state.lock();
                summary.attached += usize::from(state.sink.is_some());
                summary.running += usize::from(state.active_generation.is_some());
                summary.queued_events += state.queue.len();
                summary.dropped_events += state.dropped_events;
                summary
            },
        )
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SessionRegistry")
            .field("session_count", &inner.len())
            .field("sessions", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageId;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sid(id: &str) -> SessionId {
        SessionId::new(id)
    }

    fn chunk(text: &str) -> ServerMessage {
        ServerMessage::TextChunk {
            message_id: MessageId("m".to_string()),
            text: text.to_string(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_register_creates_session() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!registry.register(&sid("a"), tx, None));
        assert!(registry.contains(&sid("a")));
        assert!(registry.snapshot(&sid("a")).unwrap().attached);
    }

    #[test]
    fn test_emit_delivers_when_attached() {
        let registry = SessionRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);

        assert_eq!(registry.emit(&sid("a"), chunk("hi")), Delivery::Sent);
        assert_eq!(drain(&mut rx), vec![chunk("hi")]);
    }

    #[test]
    fn test_replay_in_order_exactly_once() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        registry.unregister(&sid("a"));

        for text in ["one", "two", "three"] {
            assert_eq!(registry.emit(&sid("a"), chunk(text)), Delivery::Queued);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        assert_eq!(
            drain(&mut rx),
            vec![chunk("one"), chunk("two"), chunk("three")]
        );

        // a second attach sees nothing old
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx2, None);
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(registry.snapshot(&sid("a")).unwrap().queued_events, 0);
    }

    #[test]
    fn test_dead_sink_detaches_and_queues() {
        let registry = SessionRegistry::default();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        drop(rx);

        assert_eq!(registry.emit(&sid("a"), chunk("lost?")), Delivery::Queued);
        let snapshot = registry.snapshot(&sid("a")).unwrap();
        assert!(!snapshot.attached);
        assert_eq!(snapshot.queued_events, 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        assert_eq!(drain(&mut rx), vec![chunk("lost?")]);
    }

    #[test]
    fn test_queue_overflow_drop_oldest() {
        let registry = SessionRegistry::new(RegistryConfig {
            max_queued_events: 2,
            ..RegistryConfig::default()
        });
        let ticket = registry.begin_generation(&sid("a")).unwrap();
        for text in ["1", "2", "3"] {
            ticket.emit(chunk(text));
        }
        drop(ticket);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        assert_eq!(drain(&mut rx), vec![chunk("2"), chunk("3")]);
        assert_eq!(registry.snapshot(&sid("a")).unwrap().dropped_events, 1);
    }

    #[test]
    fn test_queue_overflow_drop_newest() {
        let registry = SessionRegistry::new(RegistryConfig {
            max_queued_events: 2,
            overflow_policy: QueueOverflowPolicy::DropNewest,
            ..RegistryConfig::default()
        });
        let ticket = registry.begin_generation(&sid("a")).unwrap();
        assert_eq!(ticket.emit(chunk("1")), Delivery::Queued);
        assert_eq!(ticket.emit(chunk("2")), Delivery::Queued);
        assert_eq!(ticket.emit(chunk("3")), Delivery::Discarded);
        drop(ticket);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        assert_eq!(drain(&mut rx), vec![chunk("1"), chunk("2")]);
    }

    #[test]
    fn test_one_generation_per_session() {
        let registry = SessionRegistry::default();
        let ticket = registry.begin_generation(&sid("a")).unwrap();
        assert_eq!(
            registry.begin_generation(&sid("a")).unwrap_err(),
            RegistryError::GenerationInProgress(sid("a"))
        );
        // other sessions are independent
        assert!(registry.begin_generation(&sid("b")).is_ok());

        ticket.finish();
        let snapshot = registry.snapshot(&sid("a")).unwrap();
        assert!(!snapshot.running);
        assert!(snapshot.finished_at.is_some());
        assert!(registry.begin_generation(&sid("a")).is_ok());
    }

    #[test]
    fn test_dropped_ticket_marks_idle() {
        let registry = SessionRegistry::default();
        {
            let _ticket = registry.begin_generation(&sid("a")).unwrap();
            assert!(registry.snapshot(&sid("a")).unwrap().running);
        }
        assert!(!registry.snapshot(&sid("a")).unwrap().running);
    }

    #[test]
    fn test_disconnect_does_not_cancel() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        let ticket = registry.begin_generation(&sid("a")).unwrap();
        registry.unregister(&sid("a"));
        assert!(!ticket.is_cancelled());
        assert!(registry.snapshot(&sid("a")).unwrap().running);
    }

    #[test]
    fn test_cancel_trips_flag() {
        let registry = SessionRegistry::default();
        assert!(!registry.cancel(&sid("a")));
        let ticket = registry.begin_generation(&sid("a")).unwrap();
        assert!(registry.cancel(&sid("a")));
        assert!(ticket.is_cancelled());
    }

    #[test]
    fn test_transfer_rekeys_session_with_inflight_generation() {
        let registry = SessionRegistry::default();
        let anon = sid("anon-1");
        let durable = sid("chat-9");

        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(&anon, tx, None);
        let ticket = registry.begin_generation(&anon).unwrap();
        ticket.emit(chunk("before"));
        drop(rx); // client reloads
        ticket.emit(chunk("while away"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.register(&durable, tx, Some(&anon)));
        assert!(!registry.contains(&anon));
        assert_eq!(ticket.session_id(), durable);

        ticket.emit(chunk("after"));
        assert_eq!(drain(&mut rx), vec![chunk("while away"), chunk("after")]);
        assert!(registry.snapshot(&durable).unwrap().running);
        ticket.finish();
        assert!(!registry.snapshot(&durable).unwrap().running);
    }

    #[test]
    fn test_transfer_into_existing_session_merges() {
        let registry = SessionRegistry::default();
        let anon = sid("anon-2");
        let durable = sid("chat-10");

        let (tx, _rx_durable) = mpsc::unbounded_channel();
        registry.register(&durable, tx, None);
        registry.unregister(&durable);
        registry.emit(&durable, chunk("durable queued"));

        let ticket = registry.begin_generation(&anon).unwrap();
        ticket.emit(chunk("anon queued"));
        ticket.with_data(|data| {
            data.history.add_user_message("hello");
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.register(&durable, tx, Some(&anon)));
        assert_eq!(
            drain(&mut rx),
            vec![chunk("durable queued"), chunk("anon queued")]
        );

        // the adopted generation keeps reaching the durable session
        ticket.emit(chunk("late"));
        assert_eq!(drain(&mut rx), vec![chunk("late")]);
        let snapshot = registry.snapshot(&durable).unwrap();
        assert!(snapshot.running);
        assert_eq!(snapshot.history_len, 1);

        assert!(registry.cancel(&durable));
        assert!(ticket.is_cancelled());
        ticket.finish();
        assert!(!registry.snapshot(&durable).unwrap().running);
    }

    #[test]
    fn test_merge_into_running_session_cancels_source_generation() {
        let registry = SessionRegistry::default();
        let anon = sid("anon-3");
        let durable = sid("chat-11");

        let source = registry.begin_generation(&anon).unwrap();
        let target = registry.begin_generation(&durable).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.register(&durable, tx, Some(&anon)));

        assert!(source.is_cancelled());
        assert!(!source.is_current());
        assert!(!target.is_cancelled());
        assert!(target.is_current());

        assert_eq!(source.emit(chunk("stray")), Delivery::Discarded);
        assert_eq!(target.emit(chunk("own")), Delivery::Sent);
        assert_eq!(drain(&mut rx), vec![chunk("own")]);

        target.finish();
        assert!(!registry.snapshot(&durable).unwrap().running);

        // a new generation may start; the cancelled source never owns the session again
        let next = registry.begin_generation(&durable).unwrap();
        assert!(next.is_current());
        assert!(!source.is_current());
        drop(source);
        assert!(registry.snapshot(&durable).unwrap().running);
        assert!(matches!(
            registry.begin_generation(&durable),
            Err(RegistryError::GenerationInProgress(_))
        ));
        next.finish();
    }

    #[test]
    fn test_transfer_from_unknown_session() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!registry.register(&sid("b"), tx, Some(&sid("ghost"))));
        assert!(registry.contains(&sid("b")));
    }

    #[test]
    fn test_clear_destroys_and_cancels() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        let ticket = registry.begin_generation(&sid("a")).unwrap();

        let sink = registry.clear(&sid("a"));
        assert!(sink.is_some());
        assert!(!registry.contains(&sid("a")));
        assert!(ticket.is_cancelled());
        assert_eq!(ticket.emit(chunk("x")), Delivery::Discarded);
    }

    #[test]
    fn test_unregister_sink_ignores_replaced_client() {
        let registry = SessionRegistry::default();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), old_tx.clone(), None);
        registry.register(&sid("a"), new_tx, None);

        registry.unregister_sink(&sid("a"), &old_tx);
        assert_eq!(registry.emit(&sid("a"), chunk("still here")), Delivery::Sent);
        assert_eq!(drain(&mut new_rx), vec![chunk("still here")]);
    }

    #[test]
    fn test_cleanup_idle() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(&sid("attached"), tx, None);
        let _ticket = registry.begin_generation(&sid("running")).unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        registry.register(&sid("idle"), tx, None);
        registry.unregister(&sid("idle"));

        assert_eq!(registry.cleanup_idle(Duration::ZERO), 1);
        assert!(!registry.contains(&sid("idle")));
        assert!(registry.contains(&sid("attached")));
        assert!(registry.contains(&sid("running")));
    }

    #[test]
    fn test_summary() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(&sid("a"), tx, None);
        let ticket = registry.begin_generation(&sid("b")).unwrap();
        ticket.emit(chunk("q"));

        let summary = registry.summary();
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.attached, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.queued_events, 1);
    }

    #[tokio::test]
    async fn test_concurrent_emit_and_attach_preserves_order() {
        let registry = SessionRegistry::default();
        let id = sid("race");
        let ticket = registry.begin_generation(&id).unwrap();

        let emitter = tokio::spawn(async move {
            for i in 0..500 {
                ticket.emit(chunk(&i.to_string()));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        tokio::task::yield_now().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(&id, tx, None);
        emitter.await.unwrap();

        let texts: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                ServerMessage::TextChunk { text, .. } => text,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
    }
}
