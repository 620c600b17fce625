//! Content-addressed memoization of upstream calls.
//!
//! A key is the SHA-256 of `purpose:canonical_json(payload)`. Canonical JSON
//! sorts object keys recursively, so two payloads that differ only in field
//! order hit the same entry. The cache is a pure optimization: every lookup
//! may miss and every backend failure is swallowed here.

pub mod directory;
pub mod memory;
pub mod shared;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{CacheBackendKind, Config};
use crate::fingerprint::to_hex;

pub use directory::DirectoryCache;
pub use memory::MemoryCache;
pub use shared::SharedCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage capability behind the cache. Backends may fail; [`CacheStore`]
/// turns every failure into a miss.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// Backend that never stores anything.
pub struct NoopCache;

impl CacheBackend for NoopCache {
    fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(backend: Box<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Box::new(MemoryCache::new()), default_ttl)
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(NoopCache), Duration::ZERO)
    }

    /// Pick the configured backend. A shared or directory backend that
    /// cannot be reached degrades to the in-memory one.
    pub fn from_config(config: &Config) -> Self {
        let ttl = config.cache.ttl();
        match config.cache.backend {
            CacheBackendKind::Memory => {
                log::info!("using in-memory cache");
                Self::in_memory(ttl)
            }
            CacheBackendKind::Disabled => {
                log::info!("cache disabled");
                Self::disabled()
            }
            CacheBackendKind::Shared => {
                let url = &config.cache.redis_url;
                match SharedCache::connect(url) {
                    Ok(shared) => {
                        log::info!("shared cache connected at {url}");
                        Self::new(Box::new(shared), ttl)
                    }
                    Err(err) => {
                        log::warn!("could not connect to shared cache at {url}: {err}. Falling back to in-memory cache.");
                        Self::in_memory(ttl)
                    }
                }
            }
            CacheBackendKind::Directory => {
                let dir = config.cache_dir();
                match DirectoryCache::connect(&dir) {
                    Ok(cache) => {
                        log::info!("directory cache at {}", dir.display());
                        Self::new(Box::new(cache), ttl)
                    }
                    Err(err) => {
                        log::warn!(
                            "could not open cache directory {}: {err}. Falling back to in-memory cache.",
                            dir.display()
                        );
                        Self::in_memory(ttl)
                    }
                }
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        match self.backend.get(key) {
            Ok(Some(value)) => {
                log::debug!("cache hit backend={} key={key}", self.backend.name());
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("cache read failed backend={} key={key}: {err}", self.backend.name());
                None
            }
        }
    }

    pub fn set_raw(&self, key: &str, value: &Value, ttl: Duration) {
        if let Err(err) = self.backend.set(key, value, ttl) {
            log::warn!("cache write failed backend={} key={key}: {err}", self.backend.name());
        }
    }

    pub fn get<P: Serialize>(&self, payload: &P, purpose: &str) -> Option<Value> {
        let key = cache_key(payload, purpose)?;
        self.get_raw(&key)
    }

    pub fn set<P: Serialize>(&self, payload: &P, purpose: &str, value: &Value, ttl: Option<Duration>) {
        if let Some(key) = cache_key(payload, purpose) {
            self.set_raw(&key, value, ttl.unwrap_or(self.default_ttl));
        }
    }

    /// Typed lookup. An entry that no longer deserializes is a miss.
    pub fn get_as<P: Serialize, T: DeserializeOwned>(&self, payload: &P, purpose: &str) -> Option<T> {
        let value = self.get(payload, purpose)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                log::debug!("ignoring stale cache entry for purpose={purpose}: {err}");
                None
            }
        }
    }

    pub fn set_as<P: Serialize, T: Serialize>(&self, payload: &P, purpose: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.set(payload, purpose, &value, None),
            Err(err) => log::warn!("cache value for purpose={purpose} not serializable: {err}"),
        }
    }
}

/// Derive the cache key for a payload and purpose. Returns `None` only when
/// the payload cannot be represented as JSON.
pub fn cache_key<P: Serialize>(payload: &P, purpose: &str) -> Option<String> {
    let value = serde_json::to_value(payload).ok()?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(purpose.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    Some(to_hex(&hasher.finalize()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
