//! Idempotency-key cache.
//!
//! A client that retries a mutation with the same key gets the first
//! successful response back without re-executing. Entries live for ten
//! minutes and are pruned lazily.

use std::time::{Duration, Instant};

use serde_json::Value;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// In-memory response cache keyed by client-supplied idempotency key.
pub struct IdempotencyCache {
    ttl: Duration,
    entries: hashbrown::HashMap<String, (Instant, Value)>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IdempotencyCache {
    /// Creates a cache with the given entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: hashbrown::HashMap::new(),
        }
    }

    /// Returns the cached response for a key, if still fresh.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.prune();
        self.entries.get(key).map(|(_, response)| response.clone())
    }

    /// Stores a successful response under a key.
    pub fn put(&mut self, key: impl Into<String>, response: Value) {
        self.prune();
        self.entries.insert(key.into(), (Instant::now(), response));
    }

    /// Number of live entries.
    pub fn len(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    /// Returns true when no entry is live.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (at, _)| at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get() {
        let mut cache = IdempotencyCache::default();
        cache.put("k1", json!({"v": 6}));
        assert_eq!(cache.get("k1"), Some(json!({"v": 6})));
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    fn test_expiry() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(0));
        cache.put("k1", json!(1));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k1"), None);
        assert!(cache.is_empty());
    }
}
