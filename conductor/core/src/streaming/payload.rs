//! Structured payloads carried inside block markers

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::EditOperation;

/// Which kind of block a marker pair delimits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// JSON array of edit operations
    Edits,
    /// JSON object with a fresh document draft
    Idea,
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edits => write!(f, "edits"),
            Self::Idea => write!(f, "idea"),
        }
    }
}

/// A complete document draft proposed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaDraft {
    /// Optional heading
    #[serde(default)]
    pub title: Option<String>,
    /// Draft body
    pub content: String,
    /// Questions for the user to consider
    #[serde(default)]
    pub open_questions: Vec<String>,
    /// Quick replies the client may offer
    #[serde(default)]
    pub suggested_responses: Vec<String>,
}

impl IdeaDraft {
    /// Text written into the document
    #[must_use]
    pub fn document_text(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => format!("# {title}\n\n{}", self.content),
            _ => self.content.clone(),
        }
    }
}

/// Parsed contents of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredPayload {
    /// Edits to apply to the current document
    Edits(Vec<EditOperation>),
    /// A draft replacing the document
    Idea(IdeaDraft),
}

impl StructuredPayload {
    /// Parse a block body
    ///
    /// # Errors
    ///
    /// `PayloadError::Empty` for a blank body, `PayloadError::Json` when it
    /// does not match the block kind's shape.
    pub fn parse(kind: BlockKind, body: &str) -> Result<Self, PayloadError> {
        let body = strip_code_fence(body.trim());
        if body.is_empty() {
            return Err(PayloadError::Empty);
        }
        Ok(match kind {
            BlockKind::Edits => Self::Edits(serde_json::from_str(body)?),
            BlockKind::Idea => Self::Idea(serde_json::from_str(body)?),
        })
    }
}

/// Models like to wrap JSON in a ```json fence even inside markers
fn strip_code_fence(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Why a block could not be turned into a payload
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Opening marker without its closing marker
    #[error("missing closing marker `{0}`")]
    MissingClose(String),

    /// Nothing between the markers
    #[error("empty payload")]
    Empty,

    /// Body is not valid JSON for the block kind
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edits() {
        let payload = StructuredPayload::parse(
            BlockKind::Edits,
            r#" [{"action":"delete","hintPos":0,"startAnchor":"a","endAnchor":"b"}] "#,
        )
        .unwrap();
        assert!(matches!(payload, StructuredPayload::Edits(ops) if ops.len() == 1));
    }

    #[test]
    fn test_parse_fenced_idea() {
        let payload = StructuredPayload::parse(
            BlockKind::Idea,
            "```json\n{\"title\":\"Plan\",\"content\":\"Body\",\"openQuestions\":[\"Why?\"]}\n```",
        )
        .unwrap();
        let StructuredPayload::Idea(draft) = payload else {
            panic!("expected idea");
        };
        assert_eq!(draft.document_text(), "# Plan\n\nBody");
        assert_eq!(draft.open_questions, vec!["Why?".to_string()]);
        assert!(draft.suggested_responses.is_empty());
    }

    #[test]
    fn test_empty_and_malformed() {
        assert!(matches!(
            StructuredPayload::parse(BlockKind::Edits, "  "),
            Err(PayloadError::Empty)
        ));
        assert!(matches!(
            StructuredPayload::parse(BlockKind::Edits, "[{oops"),
            Err(PayloadError::Json(_))
        ));
    }
}
