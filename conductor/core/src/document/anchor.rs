//! Anchor resolution
//!
//! The model refers to places in the document by quoting text ("anchors")
//! plus an approximate character offset. The offset is usually stale: the
//! user may have typed since the model read the document, and earlier edits
//! in the same batch move text around. Resolution therefore treats the
//! offset as a hint only:
//!
//! 1. exact match starting at the hint
//! 2. the occurrence nearest the hint within ±100, then ±300, then ±500
//!    characters
//! 3. the first occurrence anywhere in the document
//!
//! All positions are character indices, never byte offsets.

use std::ops::Range;

use thiserror::Error;

/// Search radii tried around the hint, in order
pub const SEARCH_RINGS: [usize; 3] = [100, 300, 500];

/// Why an anchor could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    /// The anchor text occurs nowhere in the document
    #[error("anchor not found")]
    NotFound,

    /// The start anchor was found but nothing closes the span
    #[error("end anchor not found")]
    EndNotFound,

    /// The operation quoted no text to anchor on
    #[error("anchor is empty")]
    Empty,
}

/// How an anchor was located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Found exactly at the hint
    Exact,
    /// Found within the given radius of the hint
    Ring(usize),
    /// Found by scanning the whole document
    FullScan,
}

/// A resolved anchor occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorMatch {
    /// First character of the occurrence
    pub start: usize,
    /// One past the last character
    pub end: usize,
    /// How it was found
    pub strategy: MatchStrategy,
}

/// Character-indexed view over a document snapshot
#[derive(Debug)]
pub struct CharIndex<'a> {
    text: &'a str,
    /// Byte offset of every char, plus `text.len()` as a sentinel
    offsets: Vec<usize>,
}

impl<'a> CharIndex<'a> {
    /// Index a snapshot
    #[must_use]
    pub fn new(text: &'a str) -> Self {
        let mut offsets: Vec<usize> = text.char_indices().map(|(byte, _)| byte).collect();
        offsets.push(text.len());
        Self { text, offsets }
    }

    /// Length in characters
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Whether the snapshot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn byte(&self, char_index: usize) -> usize {
        self.offsets[char_index.min(self.len())]
    }

    fn char_at_byte(&self, byte: usize) -> usize {
        self.offsets.binary_search(&byte).unwrap_or_else(|i| i)
    }

    /// Whether `needle` occurs starting exactly at `at`
    #[must_use]
    pub fn matches_at(&self, needle: &str, at: usize) -> bool {
        at <= self.len() && self.text[self.byte(at)..].starts_with(needle)
    }

    /// First occurrence of `needle` starting at or after `from`
    #[must_use]
    pub fn find_from(&self, needle: &str, from: usize) -> Option<usize> {
        if from > self.len() {
            return None;
        }
        let base = self.byte(from);
        self.text[base..]
            .find(needle)
            .map(|pos| self.char_at_byte(base + pos))
    }

    /// Start indices of every occurrence (overlaps included) that starts
    /// within `lo..=hi`
    #[must_use]
    pub fn occurrences_within(&self, needle: &str, lo: usize, hi: usize) -> Vec<usize> {
        let mut found = Vec::new();
        if needle.is_empty() || lo > self.len() {
            return found;
        }
        let needle_len = needle.chars().count();
        let from = self.byte(lo);
        let to = self.byte(hi.saturating_add(needle_len));
        let hay = &self.text[from..to];

        let mut cursor = 0;
        while let Some(pos) = hay[cursor..].find(needle) {
            let at = cursor + pos;
            found.push(self.char_at_byte(from + at));
            let step = hay[at..].chars().next().map_or(1, char::len_utf8);
            cursor = at + step;
        }
        found
    }
}

/// Locate `anchor` in the snapshot, starting from `hint`
///
/// # Errors
///
/// `AnchorError::Empty` for an empty anchor, `AnchorError::NotFound` when
/// the text occurs nowhere.
pub fn resolve_anchor(
    index: &CharIndex<'_>,
    anchor: &str,
    hint: usize,
) -> Result<AnchorMatch, AnchorError> {
    if anchor.is_empty() {
        return Err(AnchorError::Empty);
    }
    let anchor_len = anchor.chars().count();
    let hint = hint.min(index.len());
    let matched = |start: usize, strategy| AnchorMatch {
        start,
        end: start + anchor_len,
        strategy,
    };

    if index.matches_at(anchor, hint) {
        return Ok(matched(hint, MatchStrategy::Exact));
    }

    for radius in SEARCH_RINGS {
        let lo = hint.saturating_sub(radius);
        let hi = hint.saturating_add(radius);
        let nearest = index
            .occurrences_within(anchor, lo, hi)
            .into_iter()
            .min_by_key(|&pos| (pos.abs_diff(hint), pos));
        if let Some(start) = nearest {
            return Ok(matched(start, MatchStrategy::Ring(radius)));
        }
    }

    index
        .find_from(anchor, 0)
        .map(|start| matched(start, MatchStrategy::FullScan))
        .ok_or(AnchorError::NotFound)
}

/// Resolve the span `start_anchor ..= end_anchor`
///
/// The end anchor is searched forward from the end of the start anchor,
/// even when both anchors are the same text. An empty end anchor means the
/// span is just the start occurrence. An end anchor overlapping the start
/// anchor closes the span when nothing follows it.
///
/// # Errors
///
/// Any [`AnchorError`] from resolving the start anchor, or
/// `AnchorError::EndNotFound`.
pub fn resolve_span(
    index: &CharIndex<'_>,
    start_anchor: &str,
    end_anchor: &str,
    hint: usize,
) -> Result<Range<usize>, AnchorError> {
    let start = resolve_anchor(index, start_anchor, hint)?;
    if end_anchor.is_empty() {
        return Ok(start.start..start.end);
    }

    let end_len = end_anchor.chars().count();
    if let Some(pos) = index.find_from(end_anchor, start.end) {
        return Ok(start.start..pos + end_len);
    }
    match index.find_from(end_anchor, start.start) {
        Some(pos) => Ok(start.start..(pos + end_len).max(start.end)),
        None => Err(AnchorError::EndNotFound),
    }
}
