//! Greeting Cache
//!
//! Opening messages for fresh conversations. Asking the model for a greeting
//! on every connect is slow and repetitive, so greetings are generated in
//! one batched call per persona and then served from a pool, sampling
//! without replacement until the pool is exhausted.
//!
//! Pools are keyed by the user's display name and a fingerprint of the
//! persona prompt, so changing the persona naturally starts a new pool.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;

use crate::backend::{LlmBackend, LlmRequest};

/// Default number of greetings generated per pool
pub const DEFAULT_POOL_SIZE: usize = 12;

/// Fewer parsed entries than this and the static pool is used instead
const MIN_PARSED_ENTRIES: usize = 3;

const FALLBACK_GREETINGS: &[&str] = &[
    "Hi{name}! What are we writing today?",
    "Hello{name}. Got an idea you want to shape into something?",
    "Hey{name}, ready when you are. Where should we start?",
    "Welcome back{name}. Want to pick up a draft or start fresh?",
    "Hi{name}! Tell me what you're working on and I'll jump in.",
];

/// Key identifying one greeting pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GreetingKey {
    /// Name the user is greeted by
    pub display_name: Option<String>,
    /// Hex CRC32 of the persona prompt
    pub persona_fingerprint: String,
}

impl GreetingKey {
    /// Build a key from a display name and the persona prompt text
    pub fn new(display_name: Option<&str>, persona: &str) -> Self {
        Self {
            display_name: display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            persona_fingerprint: hex::encode(crc32fast::hash(persona.as_bytes()).to_be_bytes()),
        }
    }
}

impl fmt::Display for GreetingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name}@{}", self.persona_fingerprint),
            None => write!(f, "anonymous@{}", self.persona_fingerprint),
        }
    }
}

/// A pool of greetings served without replacement per round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GreetingPool {
    entries: Vec<String>,
    used: HashSet<usize>,
}

impl GreetingPool {
    /// Create a pool; empty pools serve an empty string
    #[must_use]
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries,
            used: HashSet::new(),
        }
    }

    /// Greetings in the pool
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Entries not served this round
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.used.len()
    }

    /// Pick uniformly among entries not served this round
    ///
    /// Once every entry has been served the round resets and the whole pool
    /// is eligible again.
    pub fn pick_random_unused<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        if self.used.len() >= self.entries.len() {
            self.used.clear();
        }

        let unused: Vec<usize> = (0..self.entries.len())
            .filter(|i| !self.used.contains(i))
            .collect();
        let index = unused[rng.gen_range(0..unused.len())];
        self.used.insert(index);
        self.entries[index].clone()
    }
}

/// Parse a numbered list (`1.`, `1)` or `1:`) into its items
#[must_use]
pub fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                return None;
            }
            let rest = line[digits..].strip_prefix(['.', ')', ':'])?;
            let item = rest
                .trim()
                .trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}')
                .trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

fn fallback_pool(display_name: Option<&str>) -> Vec<String> {
    let name = display_name.map(|n| format!(" {n}")).unwrap_or_default();
    FALLBACK_GREETINGS
        .iter()
        .map(|g| g.replace("{name}", &name))
        .collect()
}

/// Lazily generated greeting pools per [`GreetingKey`]
pub struct GreetingCache {
    backend: Arc<dyn LlmBackend>,
    model: String,
    persona: String,
    pool_size: usize,
    pools: DashMap<GreetingKey, Arc<Mutex<Option<GreetingPool>>>>,
}

impl GreetingCache {
    /// Create a cache generating greetings with `model` in the voice of `persona`
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        model: impl Into<String>,
        persona: impl Into<String>,
        pool_size: usize,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            persona: persona.into(),
            pool_size: pool_size.max(1),
            pools: DashMap::new(),
        }
    }

    /// Key for `display_name` under this cache's persona
    #[must_use]
    pub fn key_for(&self, display_name: Option<&str>) -> GreetingKey {
        GreetingKey::new(display_name, &self.persona)
    }

    /// Next greeting for `key`, generating its pool on first use
    ///
    /// Concurrent first calls for the same key share one generation.
    pub async fn get(&self, key: &GreetingKey) -> String {
        let slot = Arc::clone(
            self.pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        );

        let mut pool = slot.lock().await;
        if pool.is_none() {
            *pool = Some(GreetingPool::new(self.generate(key).await));
        }
        match pool.as_mut() {
            Some(pool) => pool.pick_random_unused(&mut rand::thread_rng()),
            None => String::new(),
        }
    }

    /// Drop the pool for `key` so the next `get` regenerates it
    pub fn invalidate(&self, key: &GreetingKey) -> bool {
        let removed = self.pools.remove(key).is_some();
        if removed {
            tracing::debug!(key = %key, "Greeting pool invalidated");
        }
        removed
    }

    /// Number of pools held
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    async fn generate(&self, key: &GreetingKey) -> Vec<String> {
        let who = key
            .display_name
            .as_deref()
            .map_or_else(|| "the user".to_string(), |n| format!("a user named {n}"));
        let prompt = format!(
            "Write {} different short, friendly opening messages you could use to greet {who} \
             at the start of a writing session. Vary the tone. Reply with a numbered list only, \
             one greeting per line.",
            self.pool_size
        );
        let request = LlmRequest::new(prompt, &self.model)
            .with_system(self.persona.clone())
            .with_stream(false);

        match self.backend.send(&request).await {
            Ok(response) => {
                let mut entries = parse_numbered_list(&response.content);
                entries.truncate(self.pool_size);
                if entries.len() >= MIN_PARSED_ENTRIES {
                    tracing::info!(key = %key, count = entries.len(), "Generated greeting pool");
                    return entries;
                }
                tracing::warn!(
                    key = %key,
                    parsed = entries.len(),
                    "Too few greetings parsed, using fallback pool"
                );
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Greeting generation failed, using fallback pool");
            }
        }
        fallback_pool(key.display_name.as_deref())
    }
}

impl fmt::Debug for GreetingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreetingCache")
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("pool_size", &self.pool_size)
            .field("pools", &self.pools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use pretty_assertions::assert_eq;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("{i}. Greeting number {i}\n")).collect()
    }

    #[test]
    fn test_parse_numbered_list_formats() {
        let text = "Here you go:\n1. Hello!\n2) \"Hi there\"\n 3: Welcome back\n\n- not numbered\n4.\n";
        assert_eq!(
            parse_numbered_list(text),
            vec!["Hello!", "Hi there", "Welcome back"]
        );
    }

    #[test]
    fn test_greeting_rotation_serves_each_entry_once_per_round() {
        let entries: Vec<String> = (0..7).map(|i| format!("g{i}")).collect();
        let mut pool = GreetingPool::new(entries.clone());
        let mut rng = rand::thread_rng();

        let mut seen: Vec<String> = (0..entries.len())
            .map(|_| pool.pick_random_unused(&mut rng))
            .collect();
        seen.sort();
        assert_eq!(seen, entries);
        assert_eq!(pool.remaining(), 0);

        // next round starts over
        let next = pool.pick_random_unused(&mut rng);
        assert!(entries.contains(&next));
        assert_eq!(pool.remaining(), entries.len() - 1);
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = GreetingPool::new(Vec::new());
        assert_eq!(pool.pick_random_unused(&mut rand::thread_rng()), "");
    }

    #[test]
    fn test_key_fingerprint() {
        let a = GreetingKey::new(Some(" Ada "), "You are a poet.");
        let b = GreetingKey::new(Some("Ada"), "You are a poet.");
        let c = GreetingKey::new(Some("Ada"), "You are an editor.");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.persona_fingerprint.len(), 8);
        assert_eq!(GreetingKey::new(Some(""), "p").display_name, None);
    }

    #[tokio::test]
    async fn test_pool_generated_once_per_key() {
        let backend = ScriptedBackend::new().with_batch_reply(Ok(numbered(12)));
        let cache = GreetingCache::new(Arc::new(backend.clone()), "m", "persona", 12);
        let key = cache.key_for(Some("Ada"));

        let mut served = HashSet::new();
        for _ in 0..12 {
            served.insert(cache.get(&key).await);
        }
        assert_eq!(served.len(), 12);
        assert_eq!(backend.request_count(), 1);

        let request = &backend.requests()[0];
        assert!(request.last_user_prompt().unwrap_or_default().contains("Ada"));
        assert_eq!(request.system.as_deref(), Some("persona"));
    }

    #[tokio::test]
    async fn test_fallback_on_backend_failure() {
        let backend = ScriptedBackend::new();
        let cache = GreetingCache::new(Arc::new(backend), "m", "persona", 12);
        let greeting = cache.get(&cache.key_for(Some("Ada"))).await;
        assert!(greeting.contains("Ada"), "got {greeting}");
    }

    #[tokio::test]
    async fn test_fallback_on_unparseable_reply() {
        let backend = ScriptedBackend::new().with_batch_reply(Ok("Hello! Hi!".to_string()));
        let cache = GreetingCache::new(Arc::new(backend), "m", "persona", 12);
        let greeting = cache.get(&cache.key_for(None)).await;
        assert!(fallback_pool(None).contains(&greeting));
    }

    #[tokio::test]
    async fn test_invalidate_regenerates() {
        let backend = ScriptedBackend::new().with_batch_reply(Ok(numbered(3)));
        let cache = GreetingCache::new(Arc::new(backend.clone()), "m", "persona", 3);
        let key = cache.key_for(None);

        cache.get(&key).await;
        assert_eq!(cache.pool_count(), 1);
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        cache.get(&key).await;
        assert_eq!(backend.request_count(), 2);
    }
}
