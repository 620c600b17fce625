//! Resilient retrieval of source files from fallback locations.
//!
//! Every location is looked up in the cache first; misses are fetched
//! concurrently on a bounded pool. A location that is missing upstream or
//! keeps failing is simply absent: callers get a map of what was found and
//! decide what is enough.

pub mod github;
pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::CacheStore;
use crate::retry::BackoffPolicy;

pub use http::HttpSourceClient;

const SOURCE_PURPOSE: &str = "source_file";

/// One candidate place a source file may live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Logical name of the file, shared by all fallbacks for it
    pub label: String,
    pub url: String,
}

impl Location {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Location URL -> content, `None` when the location yielded nothing.
pub type CandidateMap = BTreeMap<String, Option<String>>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("no source reachable for {identity} ({attempted} locations): {last_error}")]
    Unreachable {
        identity: String,
        attempted: usize,
        last_error: String,
    },

    #[error("failed to start fetch pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("request timed out")]
    Timeout,

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status(code) => *code == 429 || (500..600).contains(code),
            Self::Connection(_) => true,
            Self::Timeout | Self::Other(_) => false,
        }
    }

    fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Transport for a single GET.
pub trait SourceClient: Send + Sync {
    /// `Ok(Some(body))` on success, `Ok(None)` when the location definitely
    /// does not exist (404, 410 and other permanent client errors).
    fn get(&self, url: &str) -> Result<Option<String>, SourceError>;
}

#[derive(Serialize, Deserialize)]
struct CachedSource {
    content: String,
}

enum Outcome {
    Present(String),
    /// Upstream answered, nothing there
    Absent,
    Failed(SourceError),
}

pub struct Fetcher {
    client: Arc<dyn SourceClient>,
    cache: Arc<CacheStore>,
    policy: BackoffPolicy,
    pool: rayon::ThreadPool,
}

impl Fetcher {
    pub fn new(
        client: Arc<dyn SourceClient>,
        cache: Arc<CacheStore>,
        policy: BackoffPolicy,
        concurrency: usize,
    ) -> Result<Self, FetchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("armory-fetch-{i}"))
            .build()
            .map_err(|e| FetchError::Pool(e.to_string()))?;

        Ok(Self {
            client,
            cache,
            policy,
            pool,
        })
    }

    /// Retrieve every location. Fails only when nothing answered at all and
    /// every failure was a connection error.
    pub fn fetch_candidates(&self, identity: &str, locations: &[Location]) -> Result<CandidateMap, FetchError> {
        let outcomes: Vec<(String, Outcome)> = self.pool.install(|| {
            locations
                .par_iter()
                .map(|location| (location.url.clone(), self.fetch_one(identity, location)))
                .collect()
        });

        let mut candidates = CandidateMap::new();
        let mut answered = false;
        let mut all_connection = true;
        let mut last_error = None;

        for (url, outcome) in outcomes {
            match outcome {
                Outcome::Present(content) => {
                    answered = true;
                    candidates.insert(url, Some(content));
                }
                Outcome::Absent => {
                    answered = true;
                    candidates.insert(url, None);
                }
                Outcome::Failed(err) => {
                    if matches!(err, SourceError::Status(_)) {
                        answered = true;
                    }
                    if !err.is_connection() {
                        all_connection = false;
                    }
                    last_error = Some(err.to_string());
                    candidates.insert(url, None);
                }
            }
        }

        if !locations.is_empty() && !answered && all_connection {
            return Err(FetchError::Unreachable {
                identity: identity.to_string(),
                attempted: locations.len(),
                last_error: last_error.unwrap_or_default(),
            });
        }

        let found = candidates.values().filter(|c| c.is_some()).count();
        log::debug!("identity={identity} locations={} found={found}", locations.len());

        Ok(candidates)
    }

    fn fetch_one(&self, identity: &str, location: &Location) -> Outcome {
        let payload = json!({ "identity": identity, "url": location.url });
        if let Some(cached) = self.cache.get_as::<_, CachedSource>(&payload, SOURCE_PURPOSE) {
            log::debug!("location={} outcome=cached", location.url);
            return Outcome::Present(cached.content);
        }

        let result = self.policy.run(
            &location.url,
            |_attempt| self.client.get(&location.url),
            SourceError::is_transient,
        );

        match result {
            Ok(Some(content)) => {
                log::debug!("location={} outcome=present bytes={}", location.url, content.len());
                self.cache.set_as(&payload, SOURCE_PURPOSE, &CachedSource { content: content.clone() });
                Outcome::Present(content)
            }
            Ok(None) => {
                log::debug!("location={} outcome=absent", location.url);
                Outcome::Absent
            }
            Err(err) => {
                log::info!("location={} outcome=absent err={err}", location.url);
                Outcome::Failed(err)
            }
        }
    }
}
