use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CacheBackend, CacheError};

const WRITE_CHECK_FILE: &str = ".write-check";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    /// unix millis
    expires_at: u64,
    value: Value,
}

/// Cache shared by every process on the host that points at the same
/// directory. One JSON file per key, sharded by the first two hex pairs.
#[derive(Clone, Debug)]
pub struct DirectoryCache {
    base_dir: PathBuf,
}

impl DirectoryCache {
    /// Open the cache directory, creating it if needed, and make sure it
    /// accepts writes.
    pub fn connect(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let base_dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;

        let check = base_dir.join(WRITE_CHECK_FILE);
        std::fs::write(&check, b"ok")?;
        let _ = std::fs::remove_file(&check);

        Ok(Self { base_dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = shard_dirs(key);
        self.base_dir
            .join(shard_a)
            .join(shard_b)
            .join(format!("{}.json", safe_component(key)))
    }
}

impl CacheBackend for DirectoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        if entry.expires_at <= now_millis() {
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entry = StoredEntry {
            expires_at: now_millis().saturating_add(ttl.as_millis() as u64),
            value: value.clone(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let tmp = temp_path(&path);
        std::fs::write(&tmp, &bytes)?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}

/// Temp file next to `path`, unique per process, thread and write.
fn temp_path(path: &Path) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let thread = format!("{:?}", std::thread::current().id());
    path.with_extension(format!(
        "json.{}.{}.{seq}.tmp",
        std::process::id(),
        safe_component(&thread)
    ))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn safe_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

fn shard_dirs(key: &str) -> (String, String) {
    let a = key.get(0..2).map(safe_component).unwrap_or_else(|| "00".into());
    let b = key.get(2..4).map(safe_component).unwrap_or_else(|| "00".into());
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "ab12cd34ef";

    #[test]
    fn test_set_then_get() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::connect(tmp.path()).unwrap();

        cache.set(KEY, &json!({"content": "x"}), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get(KEY).unwrap(), Some(json!({"content": "x"})));
        assert!(tmp.path().join("ab").join("12").join(format!("{KEY}.json")).exists());
    }

    #[test]
    fn test_visible_to_second_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DirectoryCache::connect(tmp.path()).unwrap();
        let reader = DirectoryCache::connect(tmp.path()).unwrap();

        writer.set(KEY, &json!(42), Duration::from_secs(60)).unwrap();
        assert_eq!(reader.get(KEY).unwrap(), Some(json!(42)));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::connect(tmp.path()).unwrap();
        cache.set(KEY, &json!(1), Duration::ZERO).unwrap();
        assert_eq!(cache.get(KEY).unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::connect(tmp.path()).unwrap();
        cache.set(KEY, &json!(1), Duration::from_secs(60)).unwrap();
        std::fs::write(cache.entry_path(KEY), b"{not json").unwrap();
        assert!(cache.get(KEY).is_err());
    }

    #[test]
    fn test_connect_fails_on_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(DirectoryCache::connect(&file).is_err());
    }

    #[test]
    fn test_temp_names_never_repeat() {
        let path = Path::new("/tmp/ab/12/key.json");
        let first = temp_path(path);
        let second = temp_path(path);
        assert_ne!(first, second);

        let other_thread = std::thread::spawn(move || temp_path(Path::new("/tmp/ab/12/key.json")))
            .join()
            .unwrap();
        assert_ne!(other_thread, first);
        assert_ne!(other_thread, second);
    }

    #[test]
    fn test_concurrent_writers_on_one_key() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::connect(tmp.path()).unwrap();

        std::thread::scope(|s| {
            for n in 0..8 {
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..20 {
                        cache
                            .set(KEY, &json!({"writer": n, "round": round}), Duration::from_secs(60))
                            .unwrap();
                    }
                });
            }
        });

        // whichever write landed last is intact
        let value = cache.get(KEY).unwrap().unwrap();
        assert!(value["writer"].as_u64().unwrap() < 8);
        assert!(value["round"].as_u64().unwrap() < 20);

        // no temp file is left behind
        let shard = tmp.path().join("ab").join("12");
        let leftovers: Vec<_> = std::fs::read_dir(&shard)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
