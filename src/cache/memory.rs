use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{CacheBackend, CacheError};

/// Past this many entries a write first sweeps out expired ones.
const PURGE_THRESHOLD: usize = 1024;

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Process-local cache. Expired entries are dropped when read, and swept
/// on write once the map grows past [`PURGE_THRESHOLD`].
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("lock poisoned: {e}")))?;

        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("lock poisoned: {e}")))?;

        if entries.len() >= PURGE_THRESHOLD {
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            log::debug!("memory cache purged {} expired entries", before - entries.len());
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_and_set() {
        let cache = MemoryCache::new();
        cache.set("k", &json!({"v": 1}), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(json!({"v": 1})));
        assert_eq!(cache.get("missing").unwrap(), None);
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let cache = MemoryCache::new();
        cache.set("k", &json!(1), Duration::ZERO).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_later_write_replaces_value() {
        let cache = MemoryCache::new();
        cache.set("k", &json!(1), Duration::from_secs(60)).unwrap();
        cache.set("k", &json!(2), Duration::from_secs(120)).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_expired_entries_are_swept_on_write() {
        let cache = MemoryCache::new();
        for n in 0..PURGE_THRESHOLD - 1 {
            cache.set(&format!("old-{n}"), &json!(n), Duration::ZERO).unwrap();
        }
        cache.set("live", &json!(1), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.len(), PURGE_THRESHOLD);

        // the next write crosses the threshold and drops every expired key
        cache.set("fresh", &json!(2), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("live").unwrap(), Some(json!(1)));
    }
}
