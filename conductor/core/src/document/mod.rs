//! Shared Document Editing
//!
//! Everything the agent does to the co-authored document goes through this
//! module.
//!
//! # Architecture
//!
//! ```text
//! EditOperation ──► EditEngine ──► anchor resolution (CharIndex snapshot)
//!                       │
//!                       ▼
//!                CursorPresence ──► SharedText (insert/delete + presence)
//! ```
//!
//! The engine never owns document state. It reads a snapshot, resolves
//! where the edit goes, then mutates through [`SharedText`], which may be
//! changing concurrently under other participants' hands.

pub mod anchor;
pub mod engine;
pub mod ops;
pub mod presence;
pub mod shared_text;

pub use anchor::{resolve_anchor, resolve_span, AnchorError, AnchorMatch, CharIndex, MatchStrategy};
pub use engine::{EditEngine, EditError};
pub use ops::{EditAction, EditOperation, EditResult};
pub use presence::{CursorPresence, TypingConfig};
pub use shared_text::{AgentCursor, DocumentStore, MemoryDocuments, MemoryText, SharedText, TextError};
