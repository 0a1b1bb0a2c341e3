//! Cursor Presence
//!
//! Makes agent edits look typed rather than pasted: text goes in a few
//! characters at a time with a short pause between batches, while the
//! agent's cursor is published on the presence channel so other
//! participants see where it is working.
//!
//! Cursor updates are throttled to every `cursor_every` batches. One final
//! update is always forced after the last batch so the cursor ends exactly
//! at the end of the inserted text.

use std::time::Duration;

use crate::cancel::CancelFlag;

use super::shared_text::{AgentCursor, SharedText, TextError};

/// Typing simulation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingConfig {
    /// Characters inserted per transaction
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Publish the cursor every N batches
    pub cursor_every: usize,
    /// Name shown next to the agent cursor
    pub agent_name: String,
    /// Agent cursor colour
    pub agent_color: String,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_delay: Duration::from_millis(20),
            cursor_every: 3,
            agent_name: "Coauthor".to_string(),
            agent_color: "#7c3aed".to_string(),
        }
    }
}

impl TypingConfig {
    /// Settings that insert everything at once with no pauses
    #[must_use]
    pub fn instant() -> Self {
        Self {
            batch_size: usize::MAX,
            batch_delay: Duration::ZERO,
            cursor_every: 1,
            ..Self::default()
        }
    }
}

/// Drives typed insertion and the agent cursor
#[derive(Debug, Clone)]
pub struct CursorPresence {
    config: TypingConfig,
}

impl CursorPresence {
    /// Create with the given settings
    #[must_use]
    pub fn new(config: TypingConfig) -> Self {
        Self { config }
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> &TypingConfig {
        &self.config
    }

    /// Insert `text` at `at` in batches, moving the cursor along
    ///
    /// Cancellation is checked before each batch; a batch already started
    /// always completes. Returns the number of characters inserted.
    ///
    /// # Errors
    ///
    /// `TextError` if the document rejects an insert (e.g. `at` is past the
    /// end because the text shrank underneath us).
    pub async fn stream_insert(
        &self,
        doc: &dyn SharedText,
        text: &str,
        at: usize,
        cancel: &CancelFlag,
    ) -> Result<usize, TextError> {
        let chars: Vec<char> = text.chars().collect();
        let batch_size = self.config.batch_size.max(1);
        let cursor_every = self.config.cursor_every.max(1);
        let batch_count = chars.len().div_ceil(batch_size);

        let mut pos = at;
        let mut inserted = 0;
        for (i, batch) in chars.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(inserted, remaining = chars.len() - inserted, "Typing cancelled");
                break;
            }

            let chunk: String = batch.iter().collect();
            doc.insert(pos, &chunk)?;
            pos += batch.len();
            inserted += batch.len();

            if (i + 1) % cursor_every == 0 {
                self.publish(doc, pos);
            }
            if i + 1 < batch_count && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        self.publish(doc, pos);
        Ok(inserted)
    }

    /// Show the agent cursor at `pos`
    pub fn publish(&self, doc: &dyn SharedText, pos: usize) {
        doc.set_presence(Some(AgentCursor {
            name: self.config.agent_name.clone(),
            color: self.config.agent_color.clone(),
            anchor: pos,
            head: pos,
        }));
    }

    /// Remove the agent cursor; document content is untouched
    pub fn clear_cursor(&self, doc: &dyn SharedText) {
        doc.set_presence(None);
    }
}
