//! Shared text primitive
//!
//! The replicated, conflict-resolving text the agent edits is owned by
//! something else (a CRDT provider, an editor backend). The engine only
//! needs the narrow surface in [`SharedText`]: read the current text,
//! insert and delete by character index, and publish an ephemeral cursor.
//!
//! [`MemoryText`] and [`MemoryDocuments`] are in-process implementations
//! used by the daemon's default store and by tests.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::RoomId;

/// Ephemeral cursor the agent shows to other participants
///
/// Lives on the presence channel, never in document content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCursor {
    /// Display name next to the caret
    pub name: String,
    /// Caret colour (CSS colour string)
    pub color: String,
    /// Selection anchor (character index)
    pub anchor: usize,
    /// Selection head (character index)
    pub head: usize,
}

/// Errors from the text primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    /// Index or range beyond the end of the document
    #[error("range {start}..{end} out of bounds for document of {len} chars")]
    OutOfBounds {
        /// Range start
        start: usize,
        /// Range end
        end: usize,
        /// Document length in chars
        len: usize,
    },
}

/// A shared, mutable, ordered character sequence with a presence channel
///
/// Every `insert`/`delete` is one transaction. Implementations serialize
/// mutations internally; callers hold no lock across calls.
pub trait SharedText: Send + Sync {
    /// Current document text
    fn text(&self) -> String;

    /// Length in characters
    fn len_chars(&self) -> usize;

    /// Insert `text` before character `index`
    ///
    /// # Errors
    ///
    /// `TextError::OutOfBounds` if `index > len_chars()`.
    fn insert(&self, index: usize, text: &str) -> Result<(), TextError>;

    /// Delete `len` characters starting at `index`
    ///
    /// # Errors
    ///
    /// `TextError::OutOfBounds` if the range passes the end.
    fn delete(&self, index: usize, len: usize) -> Result<(), TextError>;

    /// Publish or hide the agent cursor
    fn set_presence(&self, cursor: Option<AgentCursor>);

    /// Currently published agent cursor
    fn presence(&self) -> Option<AgentCursor>;
}

/// Resolves rooms to their shared text
pub trait DocumentStore: Send + Sync {
    /// Get the document for a room, creating an empty one if needed
    fn open(&self, room: &RoomId) -> Arc<dyn SharedText>;
}

#[derive(Debug, Default)]
struct MemoryTextInner {
    text: String,
    presence: Option<AgentCursor>,
    transactions: u64,
}

/// In-memory [`SharedText`]
#[derive(Debug, Default)]
pub struct MemoryText {
    inner: Mutex<MemoryTextInner>,
}

impl MemoryText {
    /// Create a document with initial content
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(MemoryTextInner {
                text: text.into(),
                ..MemoryTextInner::default()
            }),
        }
    }

    /// Number of mutating transactions applied so far
    #[must_use]
    pub fn transactions(&self) -> u64 {
        self.inner.lock().transactions
    }
}

fn byte_offset(text: &str, char_index: usize) -> Option<usize> {
    if char_index == 0 {
        return Some(0);
    }
    let mut seen = 0;
    for (byte, _) in text.char_indices() {
        if seen == char_index {
            return Some(byte);
        }
        seen += 1;
    }
    (seen == char_index).then_some(text.len())
}

impl SharedText for MemoryText {
    fn text(&self) -> String {
        self.inner.lock().text.clone()
    }

    fn len_chars(&self) -> usize {
        self.inner.lock().text.chars().count()
    }

    fn insert(&self, index: usize, text: &str) -> Result<(), TextError> {
        let mut inner = self.inner.lock();
        let len = inner.text.chars().count();
        let at = byte_offset(&inner.text, index).ok_or(TextError::OutOfBounds {
            start: index,
            end: index,
            len,
        })?;
        inner.text.insert_str(at, text);
        inner.transactions += 1;
        Ok(())
    }

    fn delete(&self, index: usize, len: usize) -> Result<(), TextError> {
        let mut inner = self.inner.lock();
        let doc_len = inner.text.chars().count();
        let end = index.saturating_add(len);
        let out_of_bounds = TextError::OutOfBounds {
            start: index,
            end,
            len: doc_len,
        };
        if end > doc_len {
            return Err(out_of_bounds);
        }
        let from = byte_offset(&inner.text, index).ok_or(out_of_bounds.clone())?;
        let to = byte_offset(&inner.text, end).ok_or(out_of_bounds)?;
        inner.text.replace_range(from..to, "");
        inner.transactions += 1;
        Ok(())
    }

    fn set_presence(&self, cursor: Option<AgentCursor>) {
        self.inner.lock().presence = cursor;
    }

    fn presence(&self) -> Option<AgentCursor> {
        self.inner.lock().presence.clone()
    }
}

/// In-memory [`DocumentStore`]
#[derive(Debug, Default, Clone)]
pub struct MemoryDocuments {
    rooms: Arc<DashMap<RoomId, Arc<MemoryText>>>,
}

impl MemoryDocuments {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with content, replacing any existing document
    pub fn insert(&self, room: RoomId, text: impl Into<String>) -> Arc<MemoryText> {
        let doc = Arc::new(MemoryText::new(text));
        self.rooms.insert(room, Arc::clone(&doc));
        doc
    }

    /// Get the concrete document for a room, if it exists
    #[must_use]
    pub fn get(&self, room: &RoomId) -> Option<Arc<MemoryText>> {
        self.rooms.get(room).map(|doc| Arc::clone(doc.value()))
    }

    /// Number of rooms with a document
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl DocumentStore for MemoryDocuments {
    fn open(&self, room: &RoomId) -> Arc<dyn SharedText> {
        let doc = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(MemoryText::default()))
            .clone();
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete_by_char_index() {
        let doc = MemoryText::new("naïve text");
        doc.insert(5, "!").unwrap();
        assert_eq!(doc.text(), "naïve! text");
        doc.delete(0, 3).unwrap();
        assert_eq!(doc.text(), "ve! text");
        assert_eq!(doc.transactions(), 2);
    }

    #[test]
    fn test_insert_at_end() {
        let doc = MemoryText::new("abc");
        doc.insert(3, "d").unwrap();
        assert_eq!(doc.text(), "abcd");
    }

    #[test]
    fn test_out_of_bounds() {
        let doc = MemoryText::new("abc");
        assert!(matches!(
            doc.insert(4, "x"),
            Err(TextError::OutOfBounds { .. })
        ));
        assert!(matches!(
            doc.delete(2, 5),
            Err(TextError::OutOfBounds { .. })
        ));
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.transactions(), 0);
    }

    #[test]
    fn test_presence_is_not_content() {
        let doc = MemoryText::new("abc");
        doc.set_presence(Some(AgentCursor {
            name: "Agent".to_string(),
            color: "#888".to_string(),
            anchor: 1,
            head: 1,
        }));
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.presence().map(|c| c.head), Some(1));
        doc.set_presence(None);
        assert!(doc.presence().is_none());
    }

    #[test]
    fn test_store_opens_same_document() {
        let store = MemoryDocuments::new();
        let room = RoomId::new("r1");
        store.open(&room).insert(0, "hello").unwrap();
        assert_eq!(store.open(&room).text(), "hello");
        assert_eq!(store.room_count(), 1);
    }
}
