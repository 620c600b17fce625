//! Offline fakes shared by the scenario tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::engine::{Collaborators, Engine};
use crate::fetch::github::GithubRepo;
use crate::fetch::{SourceClient, SourceError};
use crate::index::HashingEmbedder;
use crate::llm::{Completer, CompletionError};

/// Raw file host keyed by URL. Unknown URLs are 404s.
#[derive(Default)]
pub struct FakeSource {
    files: Mutex<HashMap<String, String>>,
    unreachable: bool,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Serve a README on the `main` branch of `identity`.
    pub fn with_readme(self, identity: &str, readme: &str) -> Self {
        let repo = GithubRepo::parse(identity).unwrap();
        self.files
            .lock()
            .unwrap()
            .insert(repo.raw_url("main", "README.md"), readme.to_string());
        self
    }
}

impl SourceClient for FakeSource {
    fn get(&self, url: &str) -> Result<Option<String>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(SourceError::Connection("connection refused".into()));
        }
        Ok(self.files.lock().unwrap().get(url).cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Working,
    AlwaysTimeout,
    /// Everything works except the component listing
    ComponentsDown,
}

/// Answers each prompt kind with a plausible reply derived from the prompt.
pub struct FakeCompleter {
    mode: Mode,
    model: Mutex<String>,
    pub calls: AtomicUsize,
}

impl FakeCompleter {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            model: Mutex::new("fake-model".into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn card(prompt: &str) -> String {
        let name = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Repository: "))
            .unwrap_or("unnamed")
            .trim()
            .to_string();
        serde_json::json!({
            "repo_name": name,
            "one_liner": format!("{name} toolkit for developers."),
            "primary_language": "Rust",
            "key_dependencies": ["serde"],
            "installation_method": format!("cargo add {name}"),
            "primary_use_case": format!("{name} workflows"),
            "integration_points": "library API",
            "capability_tags": [format!("#{name}"), "#tooling"],
        })
        .to_string()
    }
}

impl Completer for FakeCompleter {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.mode == Mode::AlwaysTimeout {
            return Err(CompletionError::Timeout);
        }

        if prompt.contains("Briefing Card") {
            Ok(Self::card(prompt))
        } else if prompt.contains("Impact Analysis") {
            Ok(r#"{"integration_cost": "Low", "integration_justification": "Drop-in crate.",
                   "capability_boost": "High", "capability_justification": "Adds search."}"#
                .to_string())
        } else if prompt.contains("key functions and classes") {
            if self.mode == Mode::ComponentsDown {
                return Err(CompletionError::Upstream {
                    status: 500,
                    message: "model crashed".into(),
                });
            }
            Ok("load_config, Settings".to_string())
        } else {
            Ok("Loads and validates settings.".to_string())
        }
    }

    fn model_name(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        Ok(vec!["fake-model".into(), "other-model".into()])
    }

    fn set_model(&self, model: &str) -> Result<(), CompletionError> {
        *self.model.lock().unwrap() = model.to_string();
        Ok(())
    }
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::with_base_path(root);
    config.embedding.model = "hashing-256".into();
    config.retry.attempts = 3;
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_max_ms = 0;
    config.retry.jitter_ms = 0;
    config.fetch.concurrency = 4;
    config.analysis.concurrency = 2;
    config
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub source: Arc<FakeSource>,
    pub completer: Arc<FakeCompleter>,
    pub tmp: tempfile::TempDir,
}

pub fn engine_at(root: &Path, source: Arc<FakeSource>, completer: Arc<FakeCompleter>, cache: CacheStore) -> Engine {
    let parts = Collaborators {
        source,
        completer,
        cache: Arc::new(cache),
        embedder: Arc::new(HashingEmbedder::new(256).unwrap()),
    };
    Engine::new(test_config(root), parts).unwrap()
}

pub fn test_engine(source: FakeSource, mode: Mode) -> TestEngine {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(source);
    let completer = Arc::new(FakeCompleter::new(mode));
    let engine = engine_at(
        tmp.path(),
        source.clone(),
        completer.clone(),
        CacheStore::in_memory(std::time::Duration::from_secs(60)),
    );
    TestEngine {
        engine: Arc::new(engine),
        source,
        completer,
        tmp,
    }
}

pub const ALPHA: &str = "https://github.com/acme/alpha";
pub const BETA: &str = "https://github.com/acme/beta";
pub const GAMMA: &str = "https://github.com/acme/gamma";

/// Source serving READMEs for alpha, beta and gamma.
pub fn three_repos() -> FakeSource {
    FakeSource::new()
        .with_readme(ALPHA, "# alpha\nVector search engine.")
        .with_readme(BETA, "# beta\nHTTP client.")
        .with_readme(GAMMA, "# gamma\nTerminal UI widgets.")
}
