//! Edit Engine
//!
//! Applies the model's edit operations to a room's shared text. Each
//! operation is resolved against the document as it is at the moment it is
//! applied, so concurrent human edits and earlier edits in the same batch
//! are both tolerated.
//!
//! # Batch offset compensation
//!
//! After a successful edit, later hints in the batch are shifted by that
//! edit's estimated length change. The estimate only moves hints; anchor
//! search decides where edits land. A failed edit shifts nothing and never
//! stops the batch.

use std::sync::Arc;

use thiserror::Error;

use crate::cancel::CancelFlag;
use crate::messages::RoomId;

use super::anchor::{resolve_anchor, resolve_span, AnchorError, CharIndex};
use super::ops::{EditAction, EditOperation, EditResult};
use super::presence::{CursorPresence, TypingConfig};
use super::shared_text::{DocumentStore, SharedText, TextError};

/// Why a single edit failed
#[derive(Debug, Error)]
pub enum EditError {
    /// Anchor resolution failed
    #[error(transparent)]
    Anchor(#[from] AnchorError),

    /// The text primitive rejected a mutation
    #[error("document rejected edit: {0}")]
    Text(#[from] TextError),

    /// Cancelled before the edit finished
    #[error("cancelled")]
    Cancelled,
}

/// Applies edit batches to shared documents
pub struct EditEngine {
    documents: Arc<dyn DocumentStore>,
    presence: CursorPresence,
}

impl EditEngine {
    /// Create an engine over a document store
    pub fn new(documents: Arc<dyn DocumentStore>, typing: TypingConfig) -> Self {
        Self {
            documents,
            presence: CursorPresence::new(typing),
        }
    }

    /// Current text of a room's document
    #[must_use]
    pub fn document_text(&self, room: &RoomId) -> String {
        self.documents.open(room).text()
    }

    /// Apply one operation
    pub async fn apply_edit(&self, room: &RoomId, op: &EditOperation) -> EditResult {
        let doc = self.documents.open(room);
        Self::to_result(op, self.apply_to(doc.as_ref(), op, &CancelFlag::new()).await)
    }

    /// Apply a batch in order, one result per operation
    pub async fn apply_edits(&self, room: &RoomId, ops: &[EditOperation]) -> Vec<EditResult> {
        self.apply_edits_with_cancel(room, ops, &CancelFlag::new())
            .await
    }

    /// Apply a batch, stopping between edits once `cancel` trips
    ///
    /// Operations skipped because of cancellation are reported as failed.
    pub async fn apply_edits_with_cancel(
        &self,
        room: &RoomId,
        ops: &[EditOperation],
        cancel: &CancelFlag,
    ) -> Vec<EditResult> {
        let doc = self.documents.open(room);
        let mut results = Vec::with_capacity(ops.len());
        let mut shift: isize = 0;

        for (i, op) in ops.iter().enumerate() {
            if cancel.is_cancelled() {
                results.push(EditResult::failed(op.action(), EditError::Cancelled.to_string()));
                continue;
            }

            let adjusted = op.with_hint_shift(shift);
            let outcome = self.apply_to(doc.as_ref(), &adjusted, cancel).await;
            if outcome.is_ok() {
                shift += op.estimated_delta();
            }
            let result = Self::to_result(op, outcome);
            tracing::debug!(
                room = %room,
                index = i,
                action = %result.action,
                success = result.success,
                hint = adjusted.hint_pos(),
                "Edit applied"
            );
            results.push(result);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(room = %room, total = ops.len(), failed, "Edit batch finished");
        results
    }

    /// Replace a room's whole document with a fresh draft
    pub async fn write_draft(&self, room: &RoomId, text: &str, cancel: &CancelFlag) -> EditResult {
        let doc = self.documents.open(room);
        match self.replace_all(doc.as_ref(), text, cancel).await {
            Ok(()) => EditResult::ok(EditAction::Replace),
            Err(e) => {
                tracing::warn!(room = %room, error = %e, "Draft write failed");
                EditResult::failed(EditAction::Replace, e.to_string())
            }
        }
    }

    async fn replace_all(
        &self,
        doc: &dyn SharedText,
        text: &str,
        cancel: &CancelFlag,
    ) -> Result<(), EditError> {
        doc.delete(0, doc.len_chars())?;
        self.type_text(doc, text, 0, cancel).await
    }

    /// Hide the agent cursor in a room
    pub fn clear_cursor(&self, room: &RoomId) {
        self.presence.clear_cursor(self.documents.open(room).as_ref());
    }

    fn to_result(op: &EditOperation, outcome: Result<(), EditError>) -> EditResult {
        match outcome {
            Ok(()) => EditResult::ok(op.action()),
            Err(e) => {
                tracing::warn!(action = %op.action(), error = %e, "Edit failed");
                EditResult::failed(op.action(), e.to_string())
            }
        }
    }

    async fn apply_to(
        &self,
        doc: &dyn SharedText,
        op: &EditOperation,
        cancel: &CancelFlag,
    ) -> Result<(), EditError> {
        match op {
            EditOperation::Replace {
                hint_pos,
                start_anchor,
                end_anchor,
                new_text,
            } => {
                let span = {
                    let text = doc.text();
                    resolve_span(&CharIndex::new(&text), start_anchor, end_anchor, *hint_pos)?
                };
                doc.delete(span.start, span.len())?;
                // Someone may have shortened the text since the span resolved
                let at = span.start.min(doc.len_chars());
                if at < span.start {
                    tracing::debug!(
                        span_start = span.start,
                        at,
                        "Document shrank after delete, typing at its end"
                    );
                }
                let typed = self.type_text(doc, new_text, at, cancel).await;
                if let Err(EditError::Text(e)) = &typed {
                    tracing::warn!(
                        error = %e,
                        deleted = span.len(),
                        "Replacement text not fully written after span was deleted"
                    );
                }
                typed
            }
            EditOperation::Insert {
                hint_pos,
                after_anchor,
                new_text,
            } => {
                let at = {
                    let text = doc.text();
                    let index = CharIndex::new(&text);
                    if after_anchor.is_empty() {
                        (*hint_pos).min(index.len())
                    } else {
                        resolve_anchor(&index, after_anchor, *hint_pos)?.end
                    }
                };
                self.type_text(doc, new_text, at, cancel).await
            }
            EditOperation::Delete {
                hint_pos,
                start_anchor,
                end_anchor,
            } => {
                let span = {
                    let text = doc.text();
                    resolve_span(&CharIndex::new(&text), start_anchor, end_anchor, *hint_pos)?
                };
                doc.delete(span.start, span.len())?;
                self.presence.publish(doc, span.start);
                Ok(())
            }
        }
    }

    async fn type_text(
        &self,
        doc: &dyn SharedText,
        text: &str,
        at: usize,
        cancel: &CancelFlag,
    ) -> Result<(), EditError> {
        let inserted = self.presence.stream_insert(doc, text, at, cancel).await?;
        if inserted < text.chars().count() {
            return Err(EditError::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditEngine")
            .field("presence", &self.presence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::shared_text::{AgentCursor, MemoryDocuments, MemoryText};
    use pretty_assertions::assert_eq;

    fn engine_with(room: &str, text: &str) -> (EditEngine, MemoryDocuments, RoomId) {
        let store = MemoryDocuments::new();
        let room = RoomId::new(room);
        store.insert(room.clone(), text);
        let engine = EditEngine::new(Arc::new(store.clone()), TypingConfig::instant());
        (engine, store, room)
    }

    fn replace(hint: usize, start: &str, end: &str, new: &str) -> EditOperation {
        EditOperation::Replace {
            hint_pos: hint,
            start_anchor: start.to_string(),
            end_anchor: end.to_string(),
            new_text: new.to_string(),
        }
    }

    fn insert(hint: usize, after: &str, new: &str) -> EditOperation {
        EditOperation::Insert {
            hint_pos: hint,
            after_anchor: after.to_string(),
            new_text: new.to_string(),
        }
    }

    fn delete(hint: usize, start: &str, end: &str) -> EditOperation {
        EditOperation::Delete {
            hint_pos: hint,
            start_anchor: start.to_string(),
            end_anchor: end.to_string(),
        }
    }

    #[tokio::test]
    async fn test_replace_span() {
        let (engine, _store, room) = engine_with("r", "The cat sat on the mat.");
        let result = engine
            .apply_edit(&room, &replace(4, "cat", "sat", "dog stood"))
            .await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "The dog stood on the mat.");
    }

    #[tokio::test]
    async fn test_insert_after_anchor() {
        let (engine, _store, room) = engine_with("r", "Hello world");
        let result = engine.apply_edit(&room, &insert(0, "Hello", ",")).await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "Hello, world");
    }

    #[tokio::test]
    async fn test_insert_empty_anchor_uses_clamped_hint() {
        let (engine, _store, room) = engine_with("r", "abc");
        let result = engine.apply_edit(&room, &insert(99, "", "!")).await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "abc!");
    }

    #[tokio::test]
    async fn test_delete_span() {
        let (engine, store, room) = engine_with("r", "Keep this. Drop that. Keep end.");
        let result = engine.apply_edit(&room, &delete(11, "Drop", "that. ")).await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "Keep this. Keep end.");
        assert_eq!(store.get(&room).unwrap().presence().map(|c| c.head), Some(11));
    }

    #[tokio::test]
    async fn test_anchor_not_found_leaves_document() {
        let (engine, store, room) = engine_with("r", "Nothing to see");
        let result = engine.apply_edit(&room, &delete(0, "absent", "absent")).await;
        assert_eq!(
            result,
            EditResult::failed(EditAction::Delete, "anchor not found")
        );
        assert_eq!(engine.document_text(&room), "Nothing to see");
        assert_eq!(store.get(&room).unwrap().transactions(), 0);
    }

    #[tokio::test]
    async fn test_stale_hint_after_user_typing() {
        let (engine, store, room) = engine_with("r", "Intro. Body text here.");
        // user typed at the start after the model read the document
        store.get(&room).unwrap().insert(0, "A new opening line. ").unwrap();
        let result = engine
            .apply_edit(&room, &replace(7, "Body", "here.", "Revised body."))
            .await;
        assert!(result.success);
        assert_eq!(
            engine.document_text(&room),
            "A new opening line. Intro. Revised body."
        );
    }

    #[tokio::test]
    async fn test_failed_edit_does_not_stop_batch() {
        let (engine, _store, room) = engine_with("r", "one two three");
        let results = engine
            .apply_edits(
                &room,
                &[
                    replace(0, "one", "one", "1"),
                    delete(0, "missing", "missing"),
                    replace(8, "three", "three", "3"),
                ],
            )
            .await;
        let success: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(success, vec![true, false, true]);
        assert_eq!(engine.document_text(&room), "1 two 3");
    }

    #[tokio::test]
    async fn test_batch_tolerates_wrong_estimate() {
        let (engine, _store, room) = engine_with("r", "alpha beta gamma delta");
        // the first edit's estimate is badly off, later anchors still land
        let results = engine
            .apply_edits(
                &room,
                &[
                    replace(0, "alpha", "beta", "A much longer replacement than estimated"),
                    insert(17, "gamma", "!"),
                    delete(23, " delta", " delta"),
                ],
            )
            .await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(
            engine.document_text(&room),
            "A much longer replacement than estimated gamma!"
        );
    }

    #[tokio::test]
    async fn test_identical_anchors_recover_from_wrong_hint() {
        let (engine, _store, room) = engine_with("r", "AAAA BBBB CCCC");
        let result = engine.apply_edit(&room, &replace(0, "BBBB", "BBBB", "XXXX")).await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "AAAA XXXX CCCC");
    }

    #[tokio::test]
    async fn test_long_insert_then_replace_lands_on_anchor() {
        let (engine, _store, room) = engine_with("r", "AAAA BBBB CCCC");
        let long = "1234567890123456789012345678901234567890";
        let results = engine
            .apply_edits(
                &room,
                &[insert(0, "AAAA", long), replace(10, "CCCC", "CCCC", "Y")],
            )
            .await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(engine.document_text(&room), format!("AAAA{long} BBBB Y"));
    }

    /// Text that loses its tail right after the next delete, like a
    /// collaborator cutting text while the agent is mid-replace
    struct ShrinkingText {
        inner: MemoryText,
        cut_after_delete: usize,
    }

    impl SharedText for ShrinkingText {
        fn text(&self) -> String {
            self.inner.text()
        }

        fn len_chars(&self) -> usize {
            self.inner.len_chars()
        }

        fn insert(&self, index: usize, text: &str) -> Result<(), TextError> {
            self.inner.insert(index, text)
        }

        fn delete(&self, index: usize, len: usize) -> Result<(), TextError> {
            self.inner.delete(index, len)?;
            let remaining = self.inner.len_chars();
            let cut = self.cut_after_delete.min(remaining);
            self.inner.delete(remaining - cut, cut)
        }

        fn set_presence(&self, cursor: Option<AgentCursor>) {
            self.inner.set_presence(cursor);
        }

        fn presence(&self) -> Option<AgentCursor> {
            self.inner.presence()
        }
    }

    struct SingleDocument(Arc<ShrinkingText>);

    impl DocumentStore for SingleDocument {
        fn open(&self, _room: &RoomId) -> Arc<dyn SharedText> {
            Arc::clone(&self.0) as Arc<dyn SharedText>
        }
    }

    #[tokio::test]
    async fn test_replace_survives_text_shrinking_after_delete() {
        let doc = Arc::new(ShrinkingText {
            inner: MemoryText::new("AAAA BBBB CCCC"),
            cut_after_delete: 6,
        });
        let engine = EditEngine::new(
            Arc::new(SingleDocument(Arc::clone(&doc))),
            TypingConfig::instant(),
        );
        let room = RoomId::new("r");

        let result = engine.apply_edit(&room, &replace(10, "CCCC", "", "Y")).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(doc.text(), "AAAAY");
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_skipped_edits() {
        let (engine, _store, room) = engine_with("r", "a b c");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let results = engine
            .apply_edits_with_cancel(&room, &[insert(0, "a", "1"), insert(2, "b", "2")], &cancel)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.error.as_deref() == Some("cancelled")));
        assert_eq!(engine.document_text(&room), "a b c");
    }

    #[tokio::test]
    async fn test_write_draft_replaces_document() {
        let (engine, _store, room) = engine_with("r", "old content");
        let result = engine
            .write_draft(&room, "# Title\n\nFresh draft.", &CancelFlag::new())
            .await;
        assert!(result.success);
        assert_eq!(engine.document_text(&room), "# Title\n\nFresh draft.");
    }

    #[tokio::test]
    async fn test_clear_cursor() {
        let (engine, store, room) = engine_with("r", "abc");
        engine.apply_edit(&room, &insert(0, "abc", "d")).await;
        assert!(store.get(&room).unwrap().presence().is_some());
        engine.clear_cursor(&room);
        assert!(store.get(&room).unwrap().presence().is_none());
    }
}
