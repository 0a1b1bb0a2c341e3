//! TOML Configuration File Support
//!
//! Centralized configuration loading for the co-authoring agent, from a TOML
//! file at `~/.config/coauthor/coauthor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`COAUTHOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [agent]
//! model = "llama3.2"
//! max_iterations = 3
//! temperature = 0.7
//!
//! [generation]
//! token_idle_timeout_ms = 60000
//! generation_timeout_secs = 600
//!
//! [typing]
//! batch_size = 4
//! batch_delay_ms = 20
//! cursor_every = 3
//!
//! [sessions]
//! max_queued_events = 1000
//! overflow_policy = "drop_oldest"
//! session_timeout_secs = 3600
//!
//! [greetings]
//! pool_size = 12
//!
//! [limits]
//! max_message_size = 102400
//! max_messages_per_minute = 30
//! max_history_messages = 200
//! max_edits_per_response = 50
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::TypingConfig;
use crate::greeting::DEFAULT_POOL_SIZE;
use crate::security::InputLimits;
use crate::session_registry::{QueueOverflowPolicy, RegistryConfig};

/// System prompt used when none is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Coauthor, a writing partner working with the user on a shared document. \
Chat naturally and keep replies short.

When you want to change the document, end your reply with an edit block:
[[EDITS]]
[{\"action\": \"replace\", \"hintPos\": 120, \"startAnchor\": \"exact existing text\", \"endAnchor\": \"exact existing text\", \"newText\": \"replacement\"},
 {\"action\": \"insert\", \"hintPos\": 300, \"afterAnchor\": \"exact existing text\", \"newText\": \"text to add\"},
 {\"action\": \"delete\", \"hintPos\": 40, \"startAnchor\": \"exact existing text\", \"endAnchor\": \"exact existing text\"}]
[[/EDITS]]
Anchors must be copied exactly from the current document. hintPos is your best guess of the character offset.

When the document is empty and the user describes an idea, write a first draft instead:
[[IDEA]]
{\"title\": \"...\", \"content\": \"...\", \"openQuestions\": [\"...\"], \"suggestedResponses\": [\"...\"]}
[[/IDEA]]

Never put anything but JSON between the markers.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[agent]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToml {
    /// Model identifier passed to the backend
    pub model: Option<String>,
    /// System prompt (replaces the built-in one)
    pub system_prompt: Option<String>,
    /// Maximum model passes per user message
    pub max_iterations: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

/// `[generation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Longest silence between tokens before giving up
    pub token_idle_timeout_ms: Option<u64>,
    /// Longest a whole generation may run
    pub generation_timeout_secs: Option<u64>,
}

/// `[typing]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingToml {
    /// Characters per insert transaction
    pub batch_size: Option<usize>,
    /// Pause between batches
    pub batch_delay_ms: Option<u64>,
    /// Publish the cursor every N batches
    pub cursor_every: Option<usize>,
    /// Cursor label
    pub agent_name: Option<String>,
    /// Cursor colour
    pub agent_color: Option<String>,
}

/// `[sessions]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsToml {
    /// Replay queue bound per detached session
    pub max_queued_events: Option<usize>,
    /// What to drop when the queue is full
    pub overflow_policy: Option<QueueOverflowPolicy>,
    /// Idle detached sessions are removed after this long
    pub session_timeout_secs: Option<u64>,
}

/// `[greetings]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetingsToml {
    /// Greetings generated per pool
    pub pool_size: Option<usize>,
}

/// `[limits]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsToml {
    /// Maximum user message size in bytes
    pub max_message_size: Option<usize>,
    /// Maximum user messages per minute per session
    pub max_messages_per_minute: Option<u32>,
    /// Messages kept in each session's history
    pub max_history_messages: Option<usize>,
    /// Edit operations applied from one response
    pub max_edits_per_response: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoauthorToml {
    /// Agent behaviour
    pub agent: AgentToml,
    /// Generation timeouts
    pub generation: GenerationToml,
    /// Typing simulation
    pub typing: TypingToml,
    /// Session registry
    pub sessions: SessionsToml,
    /// Greeting cache
    pub greetings: GreetingsToml,
    /// Input limits
    pub limits: LimitsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Agent behaviour settings
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    /// Model identifier passed to the backend
    pub model: String,
    /// System prompt
    pub system_prompt: String,
    /// Maximum model passes per user message
    pub max_iterations: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: 3,
            temperature: 0.7,
        }
    }
}

/// Generation timeouts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Longest silence between tokens
    pub token_idle_timeout: Duration,
    /// Longest a whole generation may run
    pub generation_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            token_idle_timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Complete configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct CoauthorConfig {
    /// Agent behaviour
    pub agent: AgentConfig,
    /// Generation timeouts
    pub generation: GenerationConfig,
    /// Typing simulation
    pub typing: TypingConfig,
    /// Session registry
    pub sessions: RegistryConfig,
    /// Greetings generated per pool
    pub greeting_pool_size: usize,
    /// Input limits
    pub limits: InputLimits,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for CoauthorConfig {
    fn default() -> Self {
        let limits = InputLimits::default();
        Self {
            agent: AgentConfig::default(),
            generation: GenerationConfig::default(),
            typing: TypingConfig::default(),
            sessions: RegistryConfig {
                max_history_messages: limits.max_history_messages,
                ..RegistryConfig::default()
            },
            greeting_pool_size: DEFAULT_POOL_SIZE,
            limits,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl CoauthorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the agent misbehave
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.agent.model.trim().is_empty() {
            return invalid("agent.model must not be empty");
        }
        if self.agent.max_iterations == 0 {
            return invalid("agent.max_iterations must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.agent.temperature) {
            return invalid("agent.temperature must be between 0.0 and 1.0");
        }
        if self.generation.token_idle_timeout.is_zero() || self.generation.generation_timeout.is_zero() {
            return invalid("generation timeouts must be greater than zero");
        }
        if self.typing.batch_size == 0 || self.typing.cursor_every == 0 {
            return invalid("typing.batch_size and typing.cursor_every must be at least 1");
        }
        if self.greeting_pool_size == 0 {
            return invalid("greetings.pool_size must be at least 1");
        }
        if self.limits.max_message_size == 0 {
            return invalid("limits.max_message_size must be greater than zero");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/coauthor/coauthor.toml` or
/// `~/.config/coauthor/coauthor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("coauthor").join("coauthor.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<CoauthorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<CoauthorConfig, ConfigError> {
    let mut config = CoauthorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: CoauthorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut CoauthorConfig, toml: &CoauthorToml) {
    // Agent settings
    if let Some(ref model) = toml.agent.model {
        config.agent.model = model.clone();
    }
    if let Some(ref prompt) = toml.agent.system_prompt {
        config.agent.system_prompt = prompt.clone();
    }
    if let Some(n) = toml.agent.max_iterations {
        config.agent.max_iterations = n;
    }
    if let Some(t) = toml.agent.temperature {
        config.agent.temperature = t;
    }

    // Generation settings
    if let Some(ms) = toml.generation.token_idle_timeout_ms {
        config.generation.token_idle_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.generation.generation_timeout_secs {
        config.generation.generation_timeout = Duration::from_secs(secs);
    }

    // Typing settings
    if let Some(n) = toml.typing.batch_size {
        config.typing.batch_size = n;
    }
    if let Some(ms) = toml.typing.batch_delay_ms {
        config.typing.batch_delay = Duration::from_millis(ms);
    }
    if let Some(n) = toml.typing.cursor_every {
        config.typing.cursor_every = n;
    }
    if let Some(ref name) = toml.typing.agent_name {
        config.typing.agent_name = name.clone();
    }
    if let Some(ref color) = toml.typing.agent_color {
        config.typing.agent_color = color.clone();
    }

    // Session settings
    if let Some(n) = toml.sessions.max_queued_events {
        config.sessions.max_queued_events = n;
    }
    if let Some(policy) = toml.sessions.overflow_policy {
        config.sessions.overflow_policy = policy;
    }
    if let Some(secs) = toml.sessions.session_timeout_secs {
        config.sessions.session_timeout = Duration::from_secs(secs);
    }

    if let Some(n) = toml.greetings.pool_size {
        config.greeting_pool_size = n;
    }

    // Limits
    if let Some(size) = toml.limits.max_message_size {
        config.limits.max_message_size = size;
    }
    if let Some(n) = toml.limits.max_messages_per_minute {
        config.limits.max_messages_per_minute = n;
    }
    if let Some(n) = toml.limits.max_history_messages {
        config.limits.max_history_messages = n;
        config.sessions.max_history_messages = n;
    }
    if let Some(n) = toml.limits.max_edits_per_response {
        config.limits.max_edits_per_response = n;
    }
}

/// Apply environment variable overrides to the config
pub fn apply_env_config(config: &mut CoauthorConfig) {
    apply_env_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from any `COAUTHOR_*` lookup
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_from(config: &mut CoauthorConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                None
            }
        }
    }

    let before = config.source;
    let mut touched = false;

    // Agent settings from environment
    if let Some(model) = lookup("COAUTHOR_MODEL") {
        config.agent.model = model;
        touched = true;
    }
    if let Some(prompt) = lookup("COAUTHOR_SYSTEM_PROMPT") {
        config.agent.system_prompt = prompt;
        touched = true;
    }
    if let Some(n) = parsed(&lookup, "COAUTHOR_MAX_ITERATIONS") {
        config.agent.max_iterations = n;
        touched = true;
    }
    if let Some(t) = parsed(&lookup, "COAUTHOR_TEMPERATURE") {
        config.agent.temperature = t;
        touched = true;
    }

    // Generation settings from environment
    if let Some(ms) = parsed(&lookup, "COAUTHOR_TOKEN_IDLE_TIMEOUT_MS") {
        config.generation.token_idle_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(secs) = parsed(&lookup, "COAUTHOR_GENERATION_TIMEOUT_SECS") {
        config.generation.generation_timeout = Duration::from_secs(secs);
        touched = true;
    }

    // Typing settings from environment
    if let Some(n) = parsed(&lookup, "COAUTHOR_TYPING_BATCH_SIZE") {
        config.typing.batch_size = n;
        touched = true;
    }
    if let Some(ms) = parsed(&lookup, "COAUTHOR_TYPING_DELAY_MS") {
        config.typing.batch_delay = Duration::from_millis(ms);
        touched = true;
    }

    // Session settings from environment
    if let Some(n) = parsed(&lookup, "COAUTHOR_MAX_QUEUED_EVENTS") {
        config.sessions.max_queued_events = n;
        touched = true;
    }
    if let Some(raw) = lookup("COAUTHOR_OVERFLOW_POLICY") {
        match raw.trim().to_lowercase().as_str() {
            "drop_oldest" => {
                config.sessions.overflow_policy = QueueOverflowPolicy::DropOldest;
                touched = true;
            }
            "drop_newest" => {
                config.sessions.overflow_policy = QueueOverflowPolicy::DropNewest;
                touched = true;
            }
            other => tracing::warn!(value = other, "Unknown COAUTHOR_OVERFLOW_POLICY"),
        }
    }
    if let Some(secs) = parsed(&lookup, "COAUTHOR_SESSION_TIMEOUT_SECS") {
        config.sessions.session_timeout = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(n) = parsed(&lookup, "COAUTHOR_GREETING_POOL_SIZE") {
        config.greeting_pool_size = n;
        touched = true;
    }

    // Limits from environment
    if let Some(size) = parsed(&lookup, "COAUTHOR_MAX_MESSAGE_SIZE") {
        config.limits.max_message_size = size;
        touched = true;
    }
    if let Some(n) = parsed(&lookup, "COAUTHOR_MAX_MESSAGES_PER_MINUTE") {
        config.limits.max_messages_per_minute = n;
        touched = true;
    }

    config.source = if touched { ConfigSource::Env } else { before };
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Model override
    pub model: Option<String>,
    /// Iteration cap override
    pub max_iterations: Option<u32>,
    /// Instant typing (no batching delay)
    pub instant_typing: bool,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set iteration cap override
    #[must_use]
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// Disable typing delays
    #[must_use]
    pub fn with_instant_typing(mut self, instant: bool) -> Self {
        self.instant_typing = instant;
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an override is invalid.
    pub fn apply(&self, config: &mut CoauthorConfig) -> Result<(), ConfigError> {
        if self.model.is_some() || self.max_iterations.is_some() || self.instant_typing {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref model) = self.model {
            config.agent.model = model.clone();
        }
        if let Some(n) = self.max_iterations {
            config.agent.max_iterations = n;
        }
        if self.instant_typing {
            config.typing = TypingConfig {
                agent_name: config.typing.agent_name.clone(),
                agent_color: config.typing.agent_color.clone(),
                ..TypingConfig::instant()
            };
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = CoauthorConfig::default();
        assert_eq!(config.agent.model, "llama3.2");
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.generation.token_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.generation.generation_timeout, Duration::from_secs(600));
        assert_eq!(config.sessions.max_queued_events, 1000);
        assert_eq!(config.sessions.overflow_policy, QueueOverflowPolicy::DropOldest);
        assert_eq!(config.greeting_pool_size, 12);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let file = write_toml(
            r#"
[agent]
model = "mistral"
max_iterations = 5

[generation]
token_idle_timeout_ms = 1500

[typing]
batch_size = 8
batch_delay_ms = 0

[sessions]
max_queued_events = 10
overflow_policy = "drop_newest"

[limits]
max_history_messages = 40
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.agent.model, "mistral");
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.generation.token_idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.typing.batch_size, 8);
        assert_eq!(config.typing.batch_delay, Duration::ZERO);
        assert_eq!(config.sessions.max_queued_events, 10);
        assert_eq!(config.sessions.overflow_policy, QueueOverflowPolicy::DropNewest);
        assert_eq!(config.sessions.max_history_messages, 40);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/coauthor.toml"))).unwrap();
        assert_eq!(config.agent.max_iterations, 3);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_toml("[agent\nmodel = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let file = write_toml("[agent]\nmax_iterations = 0\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CoauthorConfig::default();
        apply_env_from(
            &mut config,
            env(&[
                ("COAUTHOR_MODEL", "qwen"),
                ("COAUTHOR_TOKEN_IDLE_TIMEOUT_MS", "250"),
                ("COAUTHOR_OVERFLOW_POLICY", "drop_newest"),
                ("COAUTHOR_MAX_ITERATIONS", "not-a-number"),
            ]),
        );
        assert_eq!(config.agent.model, "qwen");
        assert_eq!(config.generation.token_idle_timeout, Duration::from_millis(250));
        assert_eq!(config.sessions.overflow_policy, QueueOverflowPolicy::DropNewest);
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_no_env_keeps_source() {
        let mut config = CoauthorConfig::default();
        apply_env_from(&mut config, env(&[]));
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = CoauthorConfig::default();
        ConfigOverrides::new()
            .with_model("phi3")
            .with_instant_typing(true)
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.agent.model, "phi3");
        assert_eq!(config.typing.batch_delay, Duration::ZERO);
        assert_eq!(config.source(), ConfigSource::Cli);

        let bad = ConfigOverrides::new().with_max_iterations(0).apply(&mut config);
        assert!(bad.is_err());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("coauthor/coauthor.toml"));
        }
    }
}
