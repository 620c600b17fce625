use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::{CacheBackend, CacheError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_PREFIX: &str = "armory:";

/// Cache held in a Redis server, shared by every process and host that
/// points at the same URL. Entries expire server side.
pub struct SharedCache {
    conn: Mutex<redis::Connection>,
}

impl SharedCache {
    /// Open a connection and make sure the server answers `PING`.
    pub fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
        conn.set_read_timeout(Some(IO_TIMEOUT))?;
        conn.set_write_timeout(Some(IO_TIMEOUT))?;

        let pong: String = redis::cmd("PING").query(&mut conn)?;
        if pong != "PONG" {
            return Err(CacheError::Unavailable(format!("unexpected PING reply {pong:?}")));
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, CacheError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("lock poisoned: {e}")))?;
        Ok(f(&mut *conn)?)
    }
}

impl CacheBackend for SharedCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let raw: Option<String> = self.with_conn(|conn| redis::cmd("GET").arg(redis_key(key)).query(conn))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        let secs = ttl_secs(ttl);
        self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(redis_key(key))
                .arg(raw)
                .arg("EX")
                .arg(secs)
                .query::<()>(conn)
        })
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

fn redis_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// `EX` rejects zero, so sub-second TTLs round up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
