//! Streaming Response Classification
//!
//! A model response is one stream of text carrying two things: chat for
//! the user and, optionally, a structured block for the document. This
//! module separates them while tokens are still arriving.
//!
//! # Architecture
//!
//! ```text
//! StreamingToken::Token ──► GenerationState::push ──► Classified { fragment, block }
//!                                                          │
//!                                          fragment ──► text_chunk to client
//!
//! StreamingToken::Complete ──► GenerationState::finish ──► ParsedResponse
//!                                                            ├─ chat_text
//!                                                            ├─ payload (edits | idea)
//!                                                            └─ remainder
//! ```
//!
//! # Example
//!
//! ```
//! use coauthor_core::streaming::StreamClassifier;
//!
//! let mut state = StreamClassifier::default().begin();
//! assert_eq!(state.push("Editing [[ED").fragment, "Editing ");
//! assert!(state.push("ITS]][]").block.is_some());
//! let parsed = state.finish("Editing [[EDITS]][][[/EDITS]]");
//! assert_eq!(parsed.chat_text, "Editing");
//! ```

mod classifier;
mod payload;

pub use classifier::{
    default_markers, BlockMarker, Classified, GenerationState, ParsedResponse, StreamClassifier,
};
pub use payload::{BlockKind, IdeaDraft, PayloadError, StructuredPayload};

// Re-export StreamingToken from backend for convenience
pub use crate::backend::StreamingToken;
