//! Transport Plumbing
//!
//! Pieces shared by anything that carries sessions over a byte stream: the
//! frame codec, connection identities and the default socket location. The
//! daemon owns the actual listener.
//!
//! # Connection Protocol
//!
//! ```text
//! client                                  daemon
//!   │ ── frame: Handshake ──────────────────▶ │  attach / transfer session
//!   │ ◀───────────── frame: history|greeting ─│
//!   │ ── frame: ClientMessage ──────────────▶ │
//!   │ ◀────────── frame: ServerMessage (…) ── │
//! ```
//!
//! # Security
//!
//! - Unix sockets are created with 0600 permissions
//! - The daemon checks peer credentials before reading a frame
//! - No network exposure by default

pub mod frame;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use frame::{encode, FrameDecoder, FrameError, MAX_FRAME_SIZE};

/// Unique identifier for one client connection
///
/// Connections are transient; the session they attach to is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Default Unix socket path
///
/// `$XDG_RUNTIME_DIR/coauthor/coauthor.sock`, or a per-user directory under
/// the system temp dir when no runtime dir is available.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join("coauthor"))
        .unwrap_or_else(|| {
            let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
            std::env::temp_dir().join(format!("coauthor-{user}"))
        })
        .join("coauthor.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        let formatted = id.to_string();
        assert!(formatted.starts_with("conn-"));
        // conn- (5 chars) + UUID (36 chars)
        assert_eq!(formatted.len(), 41);
    }

    #[test]
    fn test_connection_id_randomness() {
        let ids: Vec<ConnectionId> = (0..3).map(|_| ConnectionId::new()).collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.ends_with("coauthor.sock"));
    }
}
