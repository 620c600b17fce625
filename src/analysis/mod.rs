//! Per-file analysis pipeline.
//!
//! A [`Pipeline`] fans a set of [`Processor`]s out over one source file and
//! collects their outcomes by name. A processor that errors or panics is
//! recorded as failed; the others are unaffected. [`aggregate`] turns the
//! outcomes into the fixed [`AnalysisSummary`] shape.

pub mod processors;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::llm::Completer;

pub use processors::{ComponentProcessor, DependencyProcessor, DependentProcessor, SummaryProcessor};

pub const SUMMARY_UNAVAILABLE: &str = "Error generating summary.";
pub const SECTION_UNAVAILABLE: &str = "unavailable";

/// The file under analysis, read once and shared by every processor.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub project_root: PathBuf,
    pub file: PathBuf,
    pub content: String,
}

impl AnalysisInput {
    /// Read `file`. Invalid UTF-8 is replaced rather than rejected.
    pub fn read(project_root: &Path, file: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(file)?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            file: file.to_path_buf(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// File name without extension, the name other files import it by.
    pub fn module_name(&self) -> Option<&str> {
        self.file.file_stem().and_then(|s| s.to_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessorOutput {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutcome {
    Ok(ProcessorOutput),
    Failed(String),
}

pub type PipelineResult = BTreeMap<String, ProcessorOutcome>;

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, input: &AnalysisInput) -> anyhow::Result<ProcessorOutput>;
}

pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
    pool: rayon::ThreadPool,
}

impl Pipeline {
    /// Empty pipeline whose processors share a pool of `concurrency` threads.
    pub fn new(concurrency: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("armory-analysis-{i}"))
            .build()?;

        Ok(Self {
            processors: Vec::new(),
            pool,
        })
    }

    /// The summary, components, dependencies and dependents processors.
    pub fn standard(completer: Arc<dyn Completer>, concurrency: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let mut pipeline = Self::new(concurrency)?;
        pipeline.register(Arc::new(SummaryProcessor::new(completer.clone())));
        pipeline.register(Arc::new(ComponentProcessor::new(completer)));
        pipeline.register(Arc::new(DependencyProcessor));
        pipeline.register(Arc::new(DependentProcessor));
        Ok(pipeline)
    }

    /// Add a processor, replacing any registered under the same name.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        if let Some(pos) = self.processors.iter().position(|p| p.name() == processor.name()) {
            log::warn!("replacing processor={}", processor.name());
            self.processors[pos] = processor;
        } else {
            self.processors.push(processor);
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Run every processor on the pool, at most `concurrency` at a time.
    pub fn run(&self, input: &AnalysisInput) -> PipelineResult {
        let results = Mutex::new(PipelineResult::new());

        self.pool.scope(|s| {
            for p in &self.processors {
                let results = &results;
                s.spawn(move |_| {
                    let name = p.name();
                    let outcome = match catch_unwind(AssertUnwindSafe(|| p.process(input))) {
                        Ok(Ok(output)) => {
                            log::info!("processor={name} outcome=ok");
                            ProcessorOutcome::Ok(output)
                        }
                        Ok(Err(e)) => {
                            log::warn!("processor={name} outcome=error err={e:#}");
                            ProcessorOutcome::Failed(format!("{e:#}"))
                        }
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            log::error!("processor={name} outcome=panic msg={msg}");
                            ProcessorOutcome::Failed(format!("processor panicked: {msg}"))
                        }
                    };
                    match results.lock() {
                        Ok(mut map) => {
                            map.insert(name.to_string(), outcome);
                        }
                        Err(poisoned) => {
                            poisoned.into_inner().insert(name.to_string(), outcome);
                        }
                    }
                });
            }
        });

        results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Section<T> {
    Ready(T),
    Unavailable(String),
}

impl<T> Section<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub summary: Section<String>,
    pub components: Section<Vec<String>>,
    pub dependencies: Section<Vec<String>>,
    pub dependents: Section<Vec<String>>,
}

/// Fixed-shape view of a pipeline result. Missing or failed processors
/// become placeholders.
pub fn aggregate(results: &PipelineResult) -> AnalysisSummary {
    let summary = match results.get(processors::SUMMARY) {
        Some(ProcessorOutcome::Ok(ProcessorOutput::Text(text))) => Section::Ready(text.clone()),
        _ => Section::Unavailable(SUMMARY_UNAVAILABLE.to_string()),
    };

    AnalysisSummary {
        summary,
        components: list_section(results, processors::COMPONENTS),
        dependencies: list_section(results, processors::DEPENDENCIES),
        dependents: list_section(results, processors::DEPENDENTS),
    }
}

fn list_section(results: &PipelineResult, name: &str) -> Section<Vec<String>> {
    match results.get(name) {
        Some(ProcessorOutcome::Ok(ProcessorOutput::List(items))) => Section::Ready(items.clone()),
        _ => Section::Unavailable(SECTION_UNAVAILABLE.to_string()),
    }
}
