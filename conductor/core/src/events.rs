//! Client Events
//!
//! Messages sent from clients to the Conductor. Raw JSON is parsed and
//! validated here, at the boundary, so the rest of the crate only ever sees
//! well-formed values.
//!
//! # Design Philosophy
//!
//! Clients are thin: they forward what the user did and render what the
//! Conductor sends back. They never interpret agent output themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{RoomId, SessionId};

/// Messages from a client to the Conductor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The user sent a chat message
    Message {
        /// The message text
        content: String,
        /// Extra context the client wants the agent to see
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        /// Room whose document the agent should work on
        #[serde(
            default,
            rename = "roomRef",
            skip_serializing_if = "Option::is_none"
        )]
        room_ref: Option<RoomId>,
    },

    /// Forget the conversation and destroy the session
    ClearHistory,

    /// The user changed the idea the document is about
    IdeaUpdate {
        /// Current idea description
        content: String,
        /// Room the idea belongs to
        #[serde(
            default,
            rename = "roomRef",
            skip_serializing_if = "Option::is_none"
        )]
        room_ref: Option<RoomId>,
    },

    /// Stop the running generation
    Cancel,
}

impl ClientMessage {
    /// Parse and validate a raw JSON envelope
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` when the JSON is malformed, the `type` is
    /// unknown, or required fields are empty.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let msg: Self = serde_json::from_str(raw).map_err(EnvelopeError::Malformed)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check field-level invariants serde cannot express
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::EmptyField` for blank content or room refs.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self {
            Self::Message {
                content, room_ref, ..
            } => {
                if content.trim().is_empty() {
                    return Err(EnvelopeError::EmptyField("content"));
                }
                check_room(room_ref.as_ref())
            }
            Self::IdeaUpdate { room_ref, .. } => check_room(room_ref.as_ref()),
            Self::ClearHistory | Self::Cancel => Ok(()),
        }
    }

    /// The `type` tag this message serializes with
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ClearHistory => "clear_history",
            Self::IdeaUpdate { .. } => "idea_update",
            Self::Cancel => "cancel",
        }
    }
}

fn check_room(room: Option<&RoomId>) -> Result<(), EnvelopeError> {
    match room {
        Some(room) if room.as_str().trim().is_empty() => Err(EnvelopeError::EmptyField("roomRef")),
        _ => Ok(()),
    }
}

/// First frame a transport sends after a client connects
///
/// Names the session to attach to. `transfer_from` moves an anonymous
/// session (and anything it queued) onto the durable `session_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session to attach to (a fresh anonymous one when absent)
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Session whose state should move to `session_id`
    #[serde(default)]
    pub transfer_from: Option<SessionId>,
    /// Name the agent should greet the user by
    #[serde(default)]
    pub display_name: Option<String>,
    /// Room the session works on by default
    #[serde(default)]
    pub room_ref: Option<RoomId>,
}

impl Handshake {
    /// Handshake for a known session
    pub fn for_session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(SessionId::new(id)),
            ..Self::default()
        }
    }

    /// Set the session to transfer from
    #[must_use]
    pub fn with_transfer_from(mut self, id: impl Into<String>) -> Self {
        self.transfer_from = Some(SessionId::new(id));
        self
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the default room
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room_ref = Some(RoomId::new(room));
        self
    }
}

/// Errors raised while decoding a client envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// JSON did not match any known message shape
    #[error("Malformed client message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// A required field was present but blank
    #[error("Field `{0}` must not be empty")]
    EmptyField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message() {
        let msg = ClientMessage::parse(
            r#"{"type":"message","content":"Tighten the intro","roomRef":"room-1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Message {
                content: "Tighten the intro".to_string(),
                context: None,
                room_ref: Some(RoomId::new("room-1")),
            }
        );
        assert_eq!(msg.kind(), "message");
    }

    #[test]
    fn test_parse_unit_variants() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            ClientMessage::Cancel
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"clear_history"}"#).unwrap(),
            ClientMessage::ClearHistory
        );
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"shout","content":"x"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn test_rejects_blank_content() {
        let err = ClientMessage::parse(r#"{"type":"message","content":"   "}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyField("content")));
    }

    #[test]
    fn test_rejects_blank_room() {
        let err =
            ClientMessage::parse(r#"{"type":"idea_update","content":"x","roomRef":""}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyField("roomRef")));
    }

    #[test]
    fn test_handshake_camel_case() {
        let hs: Handshake = serde_json::from_str(
            r#"{"sessionId":"chat-9","transferFrom":"anon-1","displayName":"Ada"}"#,
        )
        .unwrap();
        assert_eq!(
            hs,
            Handshake::for_session("chat-9")
                .with_transfer_from("anon-1")
                .with_display_name("Ada")
        );
    }
}
