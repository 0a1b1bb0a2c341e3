//! Stream Classifier
//!
//! Splits a model response into chat text, which is shown to the user as it
//! streams, and a structured block, which is buffered and parsed only once
//! the response is complete.
//!
//! # Marker safety
//!
//! Tokens arrive in arbitrary pieces, so an opening marker like `[[EDITS]]`
//! can be split across several of them. Any suffix of the accumulated text
//! that could still grow into an opening marker is held back until the next
//! token proves otherwise. No fragment handed out ever contains a marker or
//! the start of one.

use std::sync::Arc;

use super::payload::{BlockKind, PayloadError, StructuredPayload};

/// An opening/closing marker pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarker {
    /// What the block contains
    pub kind: BlockKind,
    /// Opening marker text
    pub open: String,
    /// Closing marker text
    pub close: String,
}

impl BlockMarker {
    /// Create a marker pair
    pub fn new(kind: BlockKind, open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            kind,
            open: open.into(),
            close: close.into(),
        }
    }
}

/// Default markers: `[[EDITS]]` and `[[IDEA]]`
#[must_use]
pub fn default_markers() -> Vec<BlockMarker> {
    vec![
        BlockMarker::new(BlockKind::Edits, "[[EDITS]]", "[[/EDITS]]"),
        BlockMarker::new(BlockKind::Idea, "[[IDEA]]", "[[/IDEA]]"),
    ]
}

/// Factory for per-generation classification state
#[derive(Debug, Clone)]
pub struct StreamClassifier {
    markers: Arc<[BlockMarker]>,
}

impl Default for StreamClassifier {
    fn default() -> Self {
        Self::new(default_markers())
    }
}

impl StreamClassifier {
    /// Create a classifier; markers with an empty opening text are ignored
    #[must_use]
    pub fn new(markers: Vec<BlockMarker>) -> Self {
        let markers: Vec<BlockMarker> = markers.into_iter().filter(|m| !m.open.is_empty()).collect();
        Self {
            markers: markers.into(),
        }
    }

    /// Fresh state for one request/response cycle
    #[must_use]
    pub fn begin(&self) -> GenerationState {
        GenerationState {
            markers: Arc::clone(&self.markers),
            accumulated: String::new(),
            streamed_bytes: 0,
            streamed_len: 0,
            block: None,
        }
    }

    /// Configured markers
    #[must_use]
    pub fn markers(&self) -> &[BlockMarker] {
        &self.markers
    }
}

/// Result of classifying the text received so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    /// Chat text that is now safe to show (may be empty)
    pub fragment: String,
    /// Set once an opening marker has been seen
    pub block: Option<BlockKind>,
}

/// Final split of a complete response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Everything the user should read as chat
    pub chat_text: String,
    /// The parsed block, if there was a valid one
    pub payload: Option<StructuredPayload>,
    /// Chat text never handed out as a fragment; emit it before completing
    pub remainder: String,
}

/// Classification state for one generation
#[derive(Debug, Clone)]
pub struct GenerationState {
    markers: Arc<[BlockMarker]>,
    accumulated: String,
    streamed_bytes: usize,
    streamed_len: usize,
    block: Option<BlockKind>,
}

impl GenerationState {
    /// Append a token and classify
    pub fn push(&mut self, token: &str) -> Classified {
        let mut accumulated = std::mem::take(&mut self.accumulated);
        accumulated.push_str(token);
        let classified = self.advance(&accumulated);
        self.accumulated = accumulated;
        classified
    }

    /// Classify the full text received so far
    ///
    /// `accumulated` must extend what previous calls saw.
    pub fn advance(&mut self, accumulated: &str) -> Classified {
        if self.block.is_some() {
            return Classified {
                fragment: String::new(),
                block: self.block,
            };
        }

        // Text before `streamed_bytes` was already cleared of markers and
        // partial markers, so only the unseen tail needs scanning
        let (safe_end, block) = match self.find_open_from(accumulated, self.streamed_bytes) {
            Some((marker, idx)) => (idx, Some(marker.kind)),
            None => (accumulated.len() - self.held_suffix(accumulated), None),
        };

        let fragment = if safe_end > self.streamed_bytes {
            let fragment = &accumulated[self.streamed_bytes..safe_end];
            self.streamed_bytes = safe_end;
            self.streamed_len += fragment.chars().count();
            fragment.to_string()
        } else {
            String::new()
        };

        if let Some(kind) = block {
            tracing::debug!(block = %kind, at = self.streamed_len, "Structured block started");
            self.block = Some(kind);
        }
        Classified { fragment, block }
    }

    /// Split the complete response into chat text and payload
    ///
    /// Never fails: a block that cannot be parsed turns the whole response
    /// into chat text.
    pub fn finish(&mut self, full: &str) -> ParsedResponse {
        let Some((marker, idx)) = self.find_open_from(full, 0) else {
            return self.as_chat(full);
        };
        let kind = marker.kind;
        let close = marker.close.clone();
        let body_start = idx + marker.open.len();

        let parsed = full[body_start..]
            .find(close.as_str())
            .ok_or_else(|| PayloadError::MissingClose(close.clone()))
            .and_then(|rel| {
                let body = &full[body_start..body_start + rel];
                let trailing = &full[body_start + rel + close.len()..];
                StructuredPayload::parse(kind, body).map(|payload| (payload, trailing))
            });

        match parsed {
            Ok((payload, trailing)) => {
                let before = full[..idx].trim();
                let trailing = trailing.trim();
                let chat_text = match (before.is_empty(), trailing.is_empty()) {
                    (_, true) => before.to_string(),
                    (true, false) => trailing.to_string(),
                    (false, false) => format!("{before}\n\n{trailing}"),
                };
                let remainder = if trailing.is_empty() {
                    String::new()
                } else if self.streamed_bytes > 0 {
                    format!("\n\n{trailing}")
                } else {
                    trailing.to_string()
                };
                self.streamed_len += remainder.chars().count();
                ParsedResponse {
                    chat_text,
                    payload: Some(payload),
                    remainder,
                }
            }
            Err(e) => {
                tracing::warn!(block = %kind, error = %e, "Recoverable payload parse failure, treating response as chat");
                self.as_chat(full)
            }
        }
    }

    /// Characters of chat text handed out so far
    #[must_use]
    pub fn streamed_len(&self) -> usize {
        self.streamed_len
    }

    /// Block seen in this generation, if any
    #[must_use]
    pub fn block(&self) -> Option<BlockKind> {
        self.block
    }

    /// Text accumulated through [`push`](Self::push)
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    fn as_chat(&mut self, full: &str) -> ParsedResponse {
        let start = self.streamed_bytes.min(full.len());
        let remainder = full.get(start..).unwrap_or_default().to_string();
        self.streamed_bytes = full.len();
        self.streamed_len += remainder.chars().count();
        ParsedResponse {
            chat_text: full.trim().to_string(),
            payload: None,
            remainder,
        }
    }

    /// Earliest opening marker in `text` at or after byte `from`
    fn find_open_from(&self, text: &str, from: usize) -> Option<(&BlockMarker, usize)> {
        let tail = text.get(from..)?;
        self.markers
            .iter()
            .filter_map(|m| tail.find(m.open.as_str()).map(|idx| (m, from + idx)))
            .min_by_key(|&(_, idx)| idx)
    }

    /// Byte length of the longest suffix that is a proper prefix of a marker
    fn held_suffix(&self, text: &str) -> usize {
        self.markers
            .iter()
            .filter_map(|m| {
                (1..m.open.len())
                    .rev()
                    .filter(|&k| m.open.is_char_boundary(k))
                    .find(|&k| text.ends_with(&m.open[..k]))
            })
            .max()
            .unwrap_or(0)
    }
}
