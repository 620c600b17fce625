//! The standard processors.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{AnalysisInput, Processor, ProcessorOutput};
use crate::fetch::github::truncate_chars;
use crate::llm::Completer;

pub const SUMMARY: &str = "summary";
pub const COMPONENTS: &str = "components";
pub const DEPENDENCIES: &str = "dependencies";
pub const DEPENDENTS: &str = "dependents";

pub const EMPTY_FILE_SUMMARY: &str = "This file is empty.";

/// Source sent to the model is cut to this many characters.
const MAX_CODE_CHARS: usize = 12_000;

/// Files larger than this are not scanned for imports.
const MAX_SCAN_BYTES: u64 = 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

static PY_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*import\s+([^\n#]+)").expect("Failed to compile python import regex"));
static PY_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import\b").expect("Failed to compile python from regex"));
static RS_USE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(?:::)?(\w+(?:::\w+)*)").expect("Failed to compile rust use regex")
});
static RS_EXTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*extern\s+crate\s+(\w+)").expect("Failed to compile rust extern regex"));
static RS_MOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)\s*;").expect("Failed to compile rust mod regex")
});
static JS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#)
        .expect("Failed to compile js import regex")
});
static JS_REQUIRE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#).expect("Failed to compile js require regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Rust,
    JavaScript,
}

impl Language {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" | "pyi" => Some(Self::Python),
            "rs" => Some(Self::Rust),
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => Some(Self::JavaScript),
            _ => None,
        }
    }
}

/// Modules imported by `content`, sorted and deduplicated.
fn scan_imports(language: Language, content: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    match language {
        Language::Python => {
            for cap in PY_IMPORT.captures_iter(content) {
                for part in cap[1].split(',') {
                    if let Some(module) = part.split_whitespace().next() {
                        found.insert(module.to_string());
                    }
                }
            }
            for cap in PY_FROM.captures_iter(content) {
                // `from . import x` names no module
                let module = cap[1].trim_start_matches('.');
                if !module.is_empty() {
                    found.insert(module.to_string());
                }
            }
        }
        Language::Rust => {
            for re in [&*RS_USE, &*RS_EXTERN, &*RS_MOD] {
                found.extend(re.captures_iter(content).map(|cap| cap[1].to_string()));
            }
        }
        Language::JavaScript => {
            for re in [&*JS_IMPORT, &*JS_REQUIRE] {
                found.extend(re.captures_iter(content).map(|cap| cap[1].to_string()));
            }
        }
    }
    found.into_iter().collect()
}

/// Whether an import path names `module` as one of its segments.
fn names_module(import: &str, module: &str) -> bool {
    import
        .split(['.', ':', '/'])
        .filter(|segment| !segment.is_empty())
        .any(|segment| segment == module)
}

fn code_prompt(instruction: &str, code: &str, answer: &str) -> String {
    format!(
        "{instruction}\n---------------------\n{}\n---------------------\n{answer}: ",
        truncate_chars(code, MAX_CODE_CHARS)
    )
}

/// One-sentence LLM summary of the file.
pub struct SummaryProcessor {
    completer: Arc<dyn Completer>,
}

impl SummaryProcessor {
    pub fn new(completer: Arc<dyn Completer>) -> Self {
        Self { completer }
    }
}

impl Processor for SummaryProcessor {
    fn name(&self) -> &'static str {
        SUMMARY
    }

    fn process(&self, input: &AnalysisInput) -> anyhow::Result<ProcessorOutput> {
        if input.content.trim().is_empty() {
            return Ok(ProcessorOutput::Text(EMPTY_FILE_SUMMARY.to_string()));
        }

        let prompt = code_prompt(
            "Based on the following code, provide a concise, one-sentence summary of its primary purpose.",
            &input.content,
            "Summary",
        );
        let response = self.completer.complete(&prompt).context("summary completion failed")?;
        Ok(ProcessorOutput::Text(response.trim().to_string()))
    }
}

/// Key functions and classes, as named by the LLM.
pub struct ComponentProcessor {
    completer: Arc<dyn Completer>,
}

impl ComponentProcessor {
    pub fn new(completer: Arc<dyn Completer>) -> Self {
        Self { completer }
    }
}

impl Processor for ComponentProcessor {
    fn name(&self) -> &'static str {
        COMPONENTS
    }

    fn process(&self, input: &AnalysisInput) -> anyhow::Result<ProcessorOutput> {
        if input.content.trim().is_empty() {
            return Ok(ProcessorOutput::List(Vec::new()));
        }

        let prompt = code_prompt(
            "Based on the following code, list the names of the key functions and classes. \
             Format the output as a comma-separated list (e.g., function_one, ClassTwo, function_three).",
            &input.content,
            "Components",
        );
        let response = self.completer.complete(&prompt).context("components completion failed")?;

        let components = response
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect();
        Ok(ProcessorOutput::List(components))
    }
}

/// Modules the file imports, found by a static scan.
pub struct DependencyProcessor;

impl Processor for DependencyProcessor {
    fn name(&self) -> &'static str {
        DEPENDENCIES
    }

    fn process(&self, input: &AnalysisInput) -> anyhow::Result<ProcessorOutput> {
        let language = Language::of(&input.file)
            .with_context(|| format!("no import scanner for {}", input.file.display()))?;
        Ok(ProcessorOutput::List(scan_imports(language, &input.content)))
    }
}

/// Project files that import the file's module.
pub struct DependentProcessor;

impl Processor for DependentProcessor {
    fn name(&self) -> &'static str {
        DEPENDENTS
    }

    fn process(&self, input: &AnalysisInput) -> anyhow::Result<ProcessorOutput> {
        let module = input
            .module_name()
            .with_context(|| format!("cannot derive a module name from {}", input.file.display()))?;
        if !input.project_root.is_dir() {
            anyhow::bail!("project root {} is not a directory", input.project_root.display());
        }

        let own_path = input.file.canonicalize().unwrap_or_else(|_| input.file.clone());

        let mut builder = WalkBuilder::new(&input.project_root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .require_git(false)
            .filter_entry(|entry| {
                !(entry.file_type().is_some_and(|t| t.is_dir())
                    && entry.file_name().to_str().is_some_and(|name| SKIPPED_DIRS.contains(&name)))
            });

        let mut dependents = BTreeSet::new();
        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("skipping entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let Some(language) = Language::of(path) else {
                continue;
            };
            if entry.metadata().map(|m| m.len() > MAX_SCAN_BYTES).unwrap_or(true) {
                continue;
            }
            if path.canonicalize().map(|p| p == own_path).unwrap_or(false) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };

            if scan_imports(language, &content).iter().any(|import| names_module(import, module)) {
                let shown = path.strip_prefix(&input.project_root).unwrap_or(path);
                dependents.insert(shown.to_string_lossy().into_owned());
            }
        }

        Ok(ProcessorOutput::List(dependents.into_iter().collect()))
    }
}
