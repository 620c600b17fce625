//! Semantic search over the source files of a local project.
//!
//! Each project gets its own chunk index, persisted as a vectors.bin-format
//! snapshot under the codebase directory and kept in memory once opened.
//! A project is indexed on first query; [`CodebaseIndexer::reindex`] picks up
//! later edits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::config::CodebaseConfig;
use crate::fingerprint::fingerprint;
use crate::index::embeddings::{Embedder, EmbeddingError};
use crate::index::storage::{VectorStorage, VectorStorageError};
use crate::index::vectors::{VectorError, VectorIndex};

/// Files larger than this are not indexed.
const MAX_FILE_BYTES: u64 = 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

#[derive(Debug, thiserror::Error)]
pub enum CodebaseError {
    #[error("project {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("{0}")]
    Validation(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("snapshot error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("failed to read {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("codebase index lock poisoned")]
    Poisoned,
}

/// What a chunk entry remembers besides its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Path relative to the project root
    pub file_path: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snippet {
    pub text: String,
    pub file_path: String,
    pub score: f32,
}

type ChunkIndex = VectorIndex<ChunkMetadata>;

pub struct CodebaseIndexer {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    chunk_chars: usize,
    chunk_overlap: usize,
    loaded: Mutex<HashMap<PathBuf, Arc<ChunkIndex>>>,
}

impl CodebaseIndexer {
    pub fn new(dir: PathBuf, embedder: Arc<dyn Embedder>, config: &CodebaseConfig) -> Self {
        Self {
            dir,
            embedder,
            chunk_chars: config.chunk_chars.max(1),
            chunk_overlap: config.chunk_overlap.min(config.chunk_chars.saturating_sub(1)),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// The `k` chunks of `project` closest to `text`.
    pub fn query(&self, project: &Path, text: &str, k: usize) -> Result<Vec<Snippet>, CodebaseError> {
        if text.trim().is_empty() {
            return Err(CodebaseError::Validation("query must not be empty".into()));
        }
        let root = project_root(project)?;
        let index = self.open(&root)?;
        if k == 0 || index.is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(text)?;
        let hits = index.search(&embedding, k)?;
        log::debug!("codebase query project={} hits={}", root.display(), hits.len());

        Ok(hits
            .into_iter()
            .map(|hit| Snippet {
                text: hit.entry.metadata.text.clone(),
                file_path: hit.entry.metadata.file_path.clone(),
                score: hit.score,
            })
            .collect())
    }

    /// Re-read the project from disk, replacing its snapshot. Returns the
    /// number of chunks indexed.
    pub fn reindex(&self, project: &Path) -> Result<usize, CodebaseError> {
        let root = project_root(project)?;
        let index = Arc::new(self.build(&root)?);
        let chunks = index.len();
        self.loaded
            .lock()
            .map_err(|_| CodebaseError::Poisoned)?
            .insert(root, index);
        Ok(chunks)
    }

    fn open(&self, root: &Path) -> Result<Arc<ChunkIndex>, CodebaseError> {
        if let Some(index) = self.loaded.lock().map_err(|_| CodebaseError::Poisoned)?.get(root) {
            return Ok(index.clone());
        }

        let storage = self.storage_for(root);
        let index = if storage.exists() {
            match storage.load(&self.embedder.model_id_hash(), self.embedder.dimensions()) {
                Ok(index) => {
                    log::info!("loaded codebase index project={} chunks={}", root.display(), index.len());
                    index
                }
                Err(e) => {
                    log::warn!("codebase snapshot {} unusable ({e}), reindexing", storage.path().display());
                    self.build(root)?
                }
            }
        } else {
            self.build(root)?
        };

        let index = Arc::new(index);
        self.loaded
            .lock()
            .map_err(|_| CodebaseError::Poisoned)?
            .insert(root.to_path_buf(), index.clone());
        Ok(index)
    }

    /// Chunk and embed every indexable file. Any chunk that cannot be
    /// embedded fails the whole build.
    fn build(&self, root: &Path) -> Result<ChunkIndex, CodebaseError> {
        let files = source_files(root);
        log::info!("indexing codebase project={} files={}", root.display(), files.len());

        let mut index = ChunkIndex::new(self.embedder.dimensions());
        for path in &files {
            let Some(content) = read_text(path)? else {
                continue;
            };
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            for (n, chunk) in chunk_text(&content, self.chunk_chars, self.chunk_overlap)
                .into_iter()
                .enumerate()
            {
                if chunk.trim().is_empty() {
                    continue;
                }
                let identity = format!("{rel}#{n}");
                let embedding = self.embedder.embed(&chunk)?;
                index.insert(
                    fingerprint(&identity),
                    identity,
                    ChunkMetadata {
                        file_path: rel.clone(),
                        text: chunk,
                    },
                    embedding,
                )?;
            }
        }

        let storage = self.storage_for(root);
        let saved = std::fs::create_dir_all(&self.dir)
            .map_err(VectorStorageError::from)
            .and_then(|_| storage.save(&index, &self.embedder.model_id_hash()));
        match saved {
            Ok(()) => log::info!("codebase index saved project={} chunks={}", root.display(), index.len()),
            // the in-memory index is complete; it is only not reused across restarts
            Err(e) => log::warn!("could not save codebase snapshot {}: {e}", storage.path().display()),
        }
        Ok(index)
    }

    fn storage_for(&self, root: &Path) -> VectorStorage<ChunkMetadata> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().replace('.', "_"))
            .unwrap_or_else(|| "root".to_string());
        let key = fingerprint(&root.to_string_lossy()).short();
        VectorStorage::new(self.dir.join(format!("{name}-{key}.bin")))
    }
}

fn project_root(project: &Path) -> Result<PathBuf, CodebaseError> {
    match project.canonicalize() {
        Ok(root) if root.is_dir() => Ok(root),
        _ => Err(CodebaseError::NotFound(project.to_path_buf())),
    }
}

/// Files under `root` honoring .gitignore, hidden files excluded, sorted.
fn source_files(root: &Path) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .filter_entry(|entry| {
            !(entry.file_type().is_some_and(|t| t.is_dir())
                && entry.file_name().to_str().is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        });

    let mut files = Vec::new();
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
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            log::debug!("skipping large file {}", entry.path().display());
            continue;
        }
        files.push(entry.into_path());
    }
    files.sort();
    files
}

/// File contents, or `None` for binary and non-UTF-8 files.
fn read_text(path: &Path) -> Result<Option<String>, CodebaseError> {
    let bytes = std::fs::read(path).map_err(|source| CodebaseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.contains(&0) {
        return Ok(None);
    }
    Ok(String::from_utf8(bytes).ok())
}

/// Windows of `size` chars, each starting `size - overlap` chars after the
/// previous one.
fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::embeddings::HashingEmbedder;

    fn indexer(dir: &Path) -> CodebaseIndexer {
        CodebaseIndexer::new(
            dir.to_path_buf(),
            Arc::new(HashingEmbedder::new(128).unwrap()),
            &CodebaseConfig::default(),
        )
    }

    #[test]
    fn test_chunk_windows_overlap() {
        let text: String = "abcdefghij".into();
        assert_eq!(chunk_text(&text, 4, 1), vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunk_text(&text, 20, 5), vec!["abcdefghij"]);
        assert!(chunk_text("", 4, 1).is_empty());
    }

    #[test]
    fn test_chunks_split_on_char_boundaries() {
        let text = "ééééé";
        let chunks = chunk_text(text, 2, 0);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_walk_honors_gitignore_and_skips_binaries() {
        let project = tempfile::tempdir().unwrap();
        let root = project.path();
        std::fs::write(root.join(".gitignore"), "generated/\n").unwrap();
        std::fs::create_dir_all(root.join("generated")).unwrap();
        std::fs::write(root.join("generated/out.rs"), "fn generated() {}").unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::write(root.join("target/debug/build.rs"), "fn build() {}").unwrap();
        std::fs::write(root.join("lib.rs"), "fn lib() {}").unwrap();
        std::fs::write(root.join("blob.bin"), [0u8, 159, 146, 150]).unwrap();

        let files: Vec<_> = source_files(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(files, vec![PathBuf::from("blob.bin"), PathBuf::from("lib.rs")]);
        assert_eq!(read_text(&root.join("blob.bin")).unwrap(), None);
    }

    #[test]
    fn test_query_indexes_on_first_use() {
        let store = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("auth.rs"), "fn verify_password(hash: &str) -> bool { todo!() }").unwrap();
        std::fs::write(project.path().join("render.rs"), "fn draw_triangle(canvas: Canvas) {}").unwrap();

        let codebase = indexer(store.path());
        let hits = codebase.query(project.path(), "verify password hash", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "auth.rs");
        assert!(hits[0].text.contains("verify_password"));

        let snapshots: Vec<_> = std::fs::read_dir(store.path()).unwrap().collect();
        assert_eq!(snapshots.len(), 1);
    }

    #[test]
    fn test_validation_and_missing_project() {
        let store = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let codebase = indexer(store.path());

        assert!(matches!(
            codebase.query(project.path(), "  ", 3),
            Err(CodebaseError::Validation(_))
        ));
        assert!(matches!(
            codebase.query(&project.path().join("nope"), "x", 3),
            Err(CodebaseError::NotFound(_))
        ));
        assert!(codebase.query(project.path(), "x", 0).unwrap().is_empty());
        // empty project
        assert!(codebase.query(project.path(), "x", 3).unwrap().is_empty());
    }
}
