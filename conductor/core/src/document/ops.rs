//! Edit operations and their results

use serde::{Deserialize, Serialize};

/// One edit the agent wants applied to the shared document
///
/// Anchors are literal text snippets; `hint_pos` is only where to start
/// looking for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EditOperation {
    /// Replace the span from `start_anchor` through `end_anchor`
    #[serde(rename_all = "camelCase")]
    Replace {
        /// Approximate character offset of `start_anchor`
        #[serde(default)]
        hint_pos: usize,
        /// Text the span starts with
        start_anchor: String,
        /// Text the span ends with
        end_anchor: String,
        /// Replacement text
        new_text: String,
    },
    /// Insert `new_text` right after `after_anchor`
    #[serde(rename_all = "camelCase")]
    Insert {
        /// Approximate character offset of `after_anchor`
        #[serde(default)]
        hint_pos: usize,
        /// Text to insert after
        after_anchor: String,
        /// Text to insert
        new_text: String,
    },
    /// Delete the span from `start_anchor` through `end_anchor`
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Approximate character offset of `start_anchor`
        #[serde(default)]
        hint_pos: usize,
        /// Text the span starts with
        start_anchor: String,
        /// Text the span ends with
        end_anchor: String,
    },
}

impl EditOperation {
    /// Which kind of edit this is
    #[must_use]
    pub fn action(&self) -> EditAction {
        match self {
            Self::Replace { .. } => EditAction::Replace,
            Self::Insert { .. } => EditAction::Insert,
            Self::Delete { .. } => EditAction::Delete,
        }
    }

    /// The search hint
    #[must_use]
    pub fn hint_pos(&self) -> usize {
        match self {
            Self::Replace { hint_pos, .. }
            | Self::Insert { hint_pos, .. }
            | Self::Delete { hint_pos, .. } => *hint_pos,
        }
    }

    /// Copy of this operation with its hint shifted by `delta` characters
    ///
    /// Anchors are untouched. The hint saturates at zero.
    #[must_use]
    pub fn with_hint_shift(&self, delta: isize) -> Self {
        let mut op = self.clone();
        let shifted = self.hint_pos().saturating_add_signed(delta);
        match &mut op {
            Self::Replace { hint_pos, .. }
            | Self::Insert { hint_pos, .. }
            | Self::Delete { hint_pos, .. } => *hint_pos = shifted,
        }
        op
    }

    /// Estimated change in document length if this edit succeeds
    ///
    /// Deliberately rough: a span is assumed to be as long as its two
    /// anchors. Only used to move later hints in a batch.
    #[must_use]
    pub fn estimated_delta(&self) -> isize {
        match self {
            Self::Replace {
                start_anchor,
                end_anchor,
                new_text,
                ..
            } => char_len(new_text) - (char_len(start_anchor) + char_len(end_anchor)),
            Self::Insert { new_text, .. } => char_len(new_text),
            Self::Delete {
                start_anchor,
                end_anchor,
                ..
            } => -(char_len(start_anchor) + char_len(end_anchor)),
        }
    }
}

fn char_len(s: &str) -> isize {
    isize::try_from(s.chars().count()).unwrap_or(isize::MAX)
}

/// Kind of edit, as reported back to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditAction {
    /// Span replaced
    Replace,
    /// Text inserted
    Insert,
    /// Span deleted
    Delete,
}

impl std::fmt::Display for EditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "replace"),
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Outcome of applying one [`EditOperation`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditResult {
    /// Whether the document was changed as requested
    pub success: bool,
    /// Which kind of edit was attempted
    pub action: EditAction,
    /// Why it failed
    pub error: Option<String>,
}

impl EditResult {
    /// A successful result
    #[must_use]
    pub fn ok(action: EditAction) -> Self {
        Self {
            success: true,
            action,
            error: None,
        }
    }

    /// A failed result
    pub fn failed(action: EditAction, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_replace() {
        let op: EditOperation = serde_json::from_str(
            r#"{"action":"replace","hintPos":12,"startAnchor":"The","endAnchor":"end.","newText":"New"}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            EditOperation::Replace {
                hint_pos: 12,
                start_anchor: "The".to_string(),
                end_anchor: "end.".to_string(),
                new_text: "New".to_string(),
            }
        );
        assert_eq!(op.action(), EditAction::Replace);
    }

    #[test]
    fn test_missing_hint_defaults_to_zero() {
        let op: EditOperation =
            serde_json::from_str(r#"{"action":"insert","afterAnchor":"A","newText":"B"}"#).unwrap();
        assert_eq!(op.hint_pos(), 0);
    }

    #[test]
    fn test_estimated_delta() {
        let replace = EditOperation::Replace {
            hint_pos: 0,
            start_anchor: "ab".to_string(),
            end_anchor: "cd".to_string(),
            new_text: "xyz".to_string(),
        };
        assert_eq!(replace.estimated_delta(), -1);

        let insert = EditOperation::Insert {
            hint_pos: 0,
            after_anchor: "ab".to_string(),
            new_text: "héllo".to_string(),
        };
        assert_eq!(insert.estimated_delta(), 5);

        let delete = EditOperation::Delete {
            hint_pos: 0,
            start_anchor: "abc".to_string(),
            end_anchor: "d".to_string(),
        };
        assert_eq!(delete.estimated_delta(), -4);
    }

    #[test]
    fn test_hint_shift_saturates() {
        let op = EditOperation::Delete {
            hint_pos: 3,
            start_anchor: "x".to_string(),
            end_anchor: "x".to_string(),
        };
        assert_eq!(op.with_hint_shift(10).hint_pos(), 13);
        assert_eq!(op.with_hint_shift(-10).hint_pos(), 0);
    }
}
