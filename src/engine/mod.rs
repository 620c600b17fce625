//! The query surface: enrichment, search, deletion and file analysis over
//! one set of collaborators.

pub mod errors;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::analysis::{self, AnalysisInput, AnalysisSummary, Pipeline};
use crate::cache::CacheStore;
use crate::codebase::{CodebaseIndexer, Snippet};
use crate::config::Config;
use crate::extract::{Extractor, ImpactAnalysis};
use crate::fetch::github::{self, GithubRepo};
use crate::fetch::{Fetcher, HttpSourceClient, SourceClient};
use crate::index::{embedder_for, Embedder, IndexError, IndexManager, IndexState, Removal, SearchHit};
use crate::llm::{Completer, OllamaCompleter};
use crate::record::Record;
use crate::retry::BackoffPolicy;

pub use errors::{EngineError, ErrorClass};

/// Default number of search results.
pub const DEFAULT_TOP_K: usize = 5;

/// External capabilities the engine is built from.
pub struct Collaborators {
    pub source: Arc<dyn SourceClient>,
    pub completer: Arc<dyn Completer>,
    pub cache: Arc<CacheStore>,
    pub embedder: Arc<dyn Embedder>,
}

impl Collaborators {
    /// Production collaborators: HTTP sources, Ollama and the configured
    /// cache and embedding model.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            source: Arc::new(HttpSourceClient::new(config.fetch.timeout())?),
            completer: Arc::new(OllamaCompleter::new(&config.llm)?),
            cache: Arc::new(CacheStore::from_config(config)),
            embedder: embedder_for(&config.embedding.model, config.models_dir())?,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItem {
    Enriched { record: Record },
    Failed { identity: String, error: String },
}

pub struct Engine {
    config: Config,
    fetcher: Fetcher,
    extractor: Extractor,
    completer: Arc<dyn Completer>,
    pipeline: Pipeline,
    codebase: CodebaseIndexer,
    index: Arc<IndexManager>,
    rebuild_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: Config, parts: Collaborators) -> Result<Self, EngineError> {
        log::debug!(
            "building engine cache={} model={}",
            parts.cache.backend_name(),
            parts.completer.model_name()
        );
        let policy = BackoffPolicy::from_config(&config.retry);
        let fetcher = Fetcher::new(parts.source, parts.cache.clone(), policy, config.fetch.concurrency)?;
        let extractor = Extractor::new(parts.completer.clone(), parts.cache, policy);
        let pipeline = Pipeline::standard(parts.completer.clone(), config.analysis.concurrency)
            .context("building analysis pool")?;
        let codebase = CodebaseIndexer::new(config.codebase_dir(), parts.embedder.clone(), &config.codebase);
        let index = IndexManager::init(config.armory_dir(), config.index_dir(), parts.embedder)?;

        Ok(Self {
            config,
            fetcher,
            extractor,
            completer: parts.completer,
            pipeline,
            codebase,
            index: Arc::new(index),
            rebuild_task: Mutex::new(None),
        })
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let parts = Collaborators::from_config(&config)?;
        Ok(Self::new(config, parts)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch, extract and index one repository. Extraction problems yield a
    /// degraded record; only invalid identities, unreachable transports and
    /// index failures are errors.
    pub fn enrich(&self, identity: &str) -> Result<Record, EngineError> {
        let repo = GithubRepo::parse(identity)?;
        log::info!("enriching identity={identity}");

        let locations = github::context_locations(&repo);
        let candidates = self.fetcher.fetch_candidates(identity, &locations)?;
        let context = github::assemble_context(&repo, &locations, &candidates);

        let mut record = self.extractor.extract(identity, &context);
        record.set_enriched_at(Utc::now());

        self.watch(self.index.insert(&record))?;
        Ok(record)
    }

    /// Enrich several identities in order. One failure does not stop the rest.
    pub fn enrich_batch(&self, identities: &[String]) -> Vec<BatchItem> {
        identities
            .iter()
            .map(|identity| match self.enrich(identity) {
                Ok(record) => BatchItem::Enriched { record },
                Err(e) => {
                    log::warn!("identity={identity} outcome=failed err={e}");
                    BatchItem::Failed {
                        identity: identity.clone(),
                        error: e.to_string(),
                    }
                }
            })
            .collect()
    }

    pub fn delete(&self, identity: &str) -> Result<Removal, EngineError> {
        self.watch(self.index.delete(identity))
    }

    pub fn search(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, EngineError> {
        self.watch(self.index.search(text, k))
    }

    pub fn index_size(&self) -> Result<usize, EngineError> {
        self.watch(self.index.len())
    }

    pub fn index_state(&self) -> IndexState {
        self.index.state()
    }

    pub fn rebuild(&self) -> Result<usize, EngineError> {
        self.watch(self.index.rebuild())
    }

    /// The stored record for `identity`.
    pub fn get(&self, identity: &str) -> Result<Option<Record>, EngineError> {
        self.watch(self.index.get_record(identity))
    }

    /// Analyse `file` with its parent directory as the project root.
    pub fn analyse(&self, file: &Path) -> Result<AnalysisSummary, EngineError> {
        let name = file
            .file_name()
            .ok_or_else(|| EngineError::Validation(format!("{} is not a file path", file.display())))?;
        let root = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.analyse_in(root, Path::new(name))
    }

    /// Analyse `file` inside `project_root`. Relative file paths are taken
    /// relative to the project root.
    pub fn analyse_in(&self, project_root: &Path, file: &Path) -> Result<AnalysisSummary, EngineError> {
        let path = if file.is_relative() {
            project_root.join(file)
        } else {
            file.to_path_buf()
        };

        let input = match AnalysisInput::read(project_root, &path) {
            Ok(input) => input,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        log::info!("analysing file={} processors={:?}", path.display(), self.pipeline.names());
        let results = self.pipeline.run(&input);
        let summary = analysis::aggregate(&results);

        let ready = [
            summary.summary.is_ready(),
            summary.components.is_ready(),
            summary.dependencies.is_ready(),
            summary.dependents.is_ready(),
        ];
        let ready = ready.iter().filter(|r| **r).count();
        if ready < 4 {
            log::warn!("file={} sections_ready={ready}/4", path.display());
        }
        Ok(summary)
    }

    /// Chunks of a local project most similar to `text`. The project is
    /// indexed on first use.
    pub fn search_codebase(&self, project: &Path, text: &str, k: usize) -> Result<Vec<Snippet>, EngineError> {
        Ok(self.codebase.query(project, text, k)?)
    }

    /// Re-read a local project and replace its codebase index.
    pub fn reindex_codebase(&self, project: &Path) -> Result<usize, EngineError> {
        let chunks = self.codebase.reindex(project)?;
        log::info!("project={} chunks={chunks}", project.display());
        Ok(chunks)
    }

    /// Rate an enriched repository against a project goal.
    pub fn impact(&self, identity: &str, goal: &str, project_structure: &Value) -> Result<ImpactAnalysis, EngineError> {
        if goal.trim().is_empty() {
            return Err(EngineError::Validation("goal must not be empty".into()));
        }
        let record = match self.watch(self.index.contains(identity))? {
            true => self.get(identity)?,
            false => None,
        }
        .ok_or_else(|| EngineError::NotFound(identity.to_string()))?;

        let analysis = self.extractor.impact(identity, goal, project_structure, &record);
        if analysis.is_fallback() {
            log::warn!("identity={identity} impact=fallback");
        }
        Ok(analysis)
    }

    pub fn list_models(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.completer.list_models()?)
    }

    pub fn model_name(&self) -> String {
        self.completer.model_name()
    }

    pub fn set_model(&self, model: &str) -> Result<String, EngineError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(EngineError::Validation("model name must not be empty".into()));
        }
        self.completer.set_model(model)?;
        Ok(format!("LLM model updated to {model}"))
    }

    /// Block until a background rebuild, if any, has finished.
    pub fn wait_for_rebuild(&self) {
        let handle = match self.rebuild_task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("background rebuild panicked");
            }
        }
    }

    /// Wait for background work and flush the index.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.wait_for_rebuild();
        match Arc::try_unwrap(self.index) {
            Ok(index) => index.teardown()?,
            Err(_) => log::warn!("index still in use, skipping teardown"),
        }
        Ok(())
    }

    /// Pass a result through, scheduling a rebuild on consistency violations.
    fn watch<T>(&self, result: Result<T, IndexError>) -> Result<T, EngineError> {
        result.map_err(|e| {
            if e.is_consistency_violation() {
                self.schedule_rebuild();
            }
            e.into()
        })
    }

    fn schedule_rebuild(&self) {
        let Ok(mut task) = self.rebuild_task.lock() else {
            log::error!("rebuild task lock poisoned, not scheduling rebuild");
            return;
        };
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            log::debug!("rebuild already running");
            return;
        }

        let index = self.index.clone();
        let spawned = std::thread::Builder::new()
            .name("armory-rebuild".into())
            .spawn(move || match index.rebuild() {
                Ok(count) => log::info!("background rebuild finished entries={count}"),
                Err(e) => log::error!("background rebuild failed: {e}"),
            });

        match spawned {
            Ok(handle) => {
                log::warn!("consistency violation detected, rebuilding index in the background");
                *task = Some(handle);
            }
            Err(e) => log::error!("could not spawn rebuild thread: {e}"),
        }
    }
}
