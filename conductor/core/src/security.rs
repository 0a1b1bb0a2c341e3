//! Security Module
//!
//! Input limits for the Conductor, preventing:
//! - Oversized messages
//! - Message floods from a single session
//! - Control character injection into prompts and history
//! - Runaway edit batches from the model
//!
//! # Design Philosophy
//!
//! Limits are enforced at the boundaries where untrusted input enters the
//! system: user messages before a generation starts, and model output before
//! it touches the shared document. When in doubt, reject the input.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::EditOperation;
use crate::messages::SessionId;

/// Length of the rate limit window
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Configuration limits for the Conductor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLimits {
    /// Maximum size of a single message in bytes (default: 100KB)
    pub max_message_size: usize,
    /// Maximum messages per minute from one session (default: 30)
    pub max_messages_per_minute: u32,
    /// Maximum messages kept in a session's history (default: 200)
    pub max_history_messages: usize,
    /// Maximum edit operations applied from one response (default: 50)
    pub max_edits_per_response: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024, // 100KB
            max_messages_per_minute: 30,
            max_history_messages: 200,
            max_edits_per_response: 50,
        }
    }
}

/// Result of input validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    /// Input is valid
    Valid,
    /// Input is invalid with reason
    Invalid(String),
    /// Input was rate limited
    RateLimited(String),
}

impl ValidationResult {
    /// Check if the result indicates valid input
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Get the error message if invalid
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Invalid(msg) | Self::RateLimited(msg) => Some(msg),
        }
    }

    /// Wire error code for a rejected message
    #[must_use]
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Valid => None,
            Self::Invalid(_) => Some("invalid_message"),
            Self::RateLimited(_) => Some("rate_limited"),
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Input validator for client messages
///
/// Rate limiting is tracked per session so one noisy client cannot starve
/// the others.
#[derive(Debug)]
pub struct InputValidator {
    limits: InputLimits,
    windows: Mutex<HashMap<SessionId, RateWindow>>,
}

impl InputValidator {
    /// Create a new input validator with the given limits
    #[must_use]
    pub fn new(limits: InputLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a user message's content
    ///
    /// Does not touch the rate limit; see [`check_rate_limit`](Self::check_rate_limit).
    pub fn validate_message(&self, content: &str) -> ValidationResult {
        if content.len() > self.limits.max_message_size {
            return ValidationResult::Invalid(format!(
                "Message too large: {} bytes (max: {})",
                content.len(),
                self.limits.max_message_size
            ));
        }

        // Check for control characters (except newline, tab)
        if content
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
        {
            return ValidationResult::Invalid(
                "Message contains invalid control characters".to_string(),
            );
        }

        ValidationResult::Valid
    }

    /// Truncate an edit batch to `max_edits_per_response`
    ///
    /// Returns how many operations were dropped.
    pub fn cap_edits(&self, ops: &mut Vec<EditOperation>) -> usize {
        let max = self.limits.max_edits_per_response;
        if ops.len() <= max {
            return 0;
        }
        let dropped = ops.len() - max;
        tracing::warn!(
            requested = ops.len(),
            max,
            dropped,
            "Edit batch exceeds limit, truncating"
        );
        ops.truncate(max);
        dropped
    }

    /// Drop rate limit state for a session that was cleared
    pub fn forget(&self, session: &SessionId) {
        self.windows.lock().remove(session);
    }

    /// Count a message against `session`'s per-minute limit
    ///
    /// Call only for messages that were accepted for processing.
    pub fn check_rate_limit(&self, session: &SessionId) -> ValidationResult {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let window = windows.entry(session.clone()).or_insert(RateWindow {
            started: now,
            count: 0,
        });

        // Reset window if it's been more than a minute
        if now.duration_since(window.started) >= RATE_WINDOW {
            window.started = now;
            window.count = 0;
        }

        window.count += 1;
        if window.count > self.limits.max_messages_per_minute {
            return ValidationResult::RateLimited(format!(
                "Rate limit exceeded: {} messages/minute (max: {})",
                window.count, self.limits.max_messages_per_minute
            ));
        }

        ValidationResult::Valid
    }

    /// Get the current limits
    #[must_use]
    pub fn limits(&self) -> &InputLimits {
        &self.limits
    }
}
