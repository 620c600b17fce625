use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (same family the index was designed around)
const DEFAULT_EMBED_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_LLM_MODEL: &str = "gemma3n:e4b";
const DEFAULT_LLM_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 300;

const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 4000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_JITTER_MS: u64 = 500;

const DEFAULT_FETCH_CONCURRENCY: usize = 8;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

const DEFAULT_ANALYSIS_CONCURRENCY: usize = 4;

const DEFAULT_CHUNK_CHARS: usize = 1024;
const DEFAULT_CHUNK_OVERLAP: usize = 20;

const DEFAULT_LISTEN: &str = "127.0.0.1:5001";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// fastembed model name, or `hashing-<dims>` for the offline embedder
    #[serde(default = "default_embed_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embed_model(),
        }
    }
}

fn default_embed_model() -> String {
    DEFAULT_EMBED_MODEL.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Ollama endpoint
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
        }
    }
}

fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

fn default_llm_base_url() -> String {
    DEFAULT_LLM_BASE_URL.to_string()
}

fn default_llm_timeout_secs() -> u64 {
    DEFAULT_LLM_TIMEOUT_SECS
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    /// Redis server at `cache.redis_url`
    Shared,
    /// Directory shared between processes on this host
    Directory,
    Disabled,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "shared" | "redis" => Ok(Self::Shared),
            "directory" | "disk" => Ok(Self::Directory),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => bail!("unknown cache backend '{other}' (expected memory, shared, directory or disabled)"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Location of the directory cache. Defaults to `<base_path>/cache`.
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            redis_url: default_redis_url(),
            dir: None,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for transient upstream failures
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_jitter_ms() -> u64 {
    DEFAULT_JITTER_MS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum in-flight source requests
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_FETCH_CONCURRENCY,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_fetch_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_concurrency")]
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_ANALYSIS_CONCURRENCY,
        }
    }
}

fn default_analysis_concurrency() -> usize {
    DEFAULT_ANALYSIS_CONCURRENCY
}

/// Chunking of source files for codebase search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodebaseConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for CodebaseConfig {
    fn default() -> Self {
        Self {
            chunk_chars: DEFAULT_CHUNK_CHARS,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

fn default_chunk_chars() -> usize {
    DEFAULT_CHUNK_CHARS
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub codebase: CodebaseConfig,
    #[serde(default)]
    pub web: WebConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    /// In-memory config rooted at `base_path`, nothing read or written.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be greater than 0");
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            bail!(
                "retry.backoff_base_ms ({}) must not exceed retry.backoff_max_ms ({})",
                self.retry.backoff_base_ms,
                self.retry.backoff_max_ms
            );
        }
        if self.fetch.concurrency == 0 {
            bail!("fetch.concurrency must be greater than 0");
        }
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be greater than 0");
        }
        if self.analysis.concurrency == 0 {
            bail!("analysis.concurrency must be greater than 0");
        }
        if self.codebase.chunk_overlap >= self.codebase.chunk_chars {
            bail!(
                "codebase.chunk_overlap ({}) must be smaller than codebase.chunk_chars ({})",
                self.codebase.chunk_overlap,
                self.codebase.chunk_chars
            );
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than 0");
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        if self.cache.backend == CacheBackendKind::Shared && self.cache.redis_url.trim().is_empty() {
            bail!("cache.redis_url must not be empty for the shared backend");
        }
        Ok(())
    }

    /// Environment overrides, applied after the file is read and never saved back.
    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(model) = std::env::var("ARMORY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(model) = std::env::var("ARMORY_EMBED_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(url) = std::env::var("ARMORY_OLLAMA_URL") {
            self.llm.base_url = url;
        }
        if let Ok(backend) = std::env::var("ARMORY_CACHE_BACKEND") {
            self.cache.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("ARMORY_REDIS_URL") {
            self.cache.redis_url = url;
        }
        if let Ok(dir) = std::env::var("ARMORY_CACHE_DIR") {
            self.cache.dir = Some(dir);
        }
        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    /// `ARMORY_HOME`, else `~/.local/share/armory`, else `./.armory`.
    pub fn default_base_path() -> PathBuf {
        if let Some(home) = std::env::var_os("ARMORY_HOME").filter(|h| !h.is_empty()) {
            return PathBuf::from(home);
        }
        match homedir::my_home() {
            Ok(Some(home)) => home.join(".local").join("share").join("armory"),
            _ => PathBuf::from(".armory"),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// One JSON source artifact per identity.
    pub fn armory_dir(&self) -> PathBuf {
        self.base_path.join("armory")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_path.join("armory_index")
    }

    /// Per-project codebase snapshots.
    pub fn codebase_dir(&self) -> PathBuf {
        self.index_dir().join("codebase")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.base_path.join("cache"))
    }
}
