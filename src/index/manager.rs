//! Owner of the vector index, its snapshot and the source artifacts.
//!
//! The index is loaded lazily on first use. A snapshot that is missing,
//! unreadable, built with another model, or out of step with the artifacts
//! triggers a full rebuild from the artifacts. Mutations hold the write lock
//! for their whole duration, so readers observe either the state before or
//! after a mutation, never a mix.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use serde::Serialize;

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::index::artifacts::{ArtifactError, ArtifactStore};
use crate::index::embeddings::{Embedder, EmbeddingError};
use crate::index::storage::{VectorStorage, VectorStorageError};
use crate::index::vectors::{VectorError, VectorIndex};
use crate::record::{EntryMetadata, Record, Searchable};

pub const SNAPSHOT_FILE: &str = "vectors.bin";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("fingerprint {fingerprint} of {identity} is already taken by {existing}")]
    ConsistencyViolation {
        identity: String,
        fingerprint: Fingerprint,
        existing: String,
    },

    #[error("snapshot error: {0}")]
    Persistence(#[from] VectorStorageError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    #[error("vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("index lock poisoned")]
    Poisoned,
}

impl IndexError {
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, Self::ConsistencyViolation { .. })
    }
}

/// Lifecycle of the in-memory index, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexState {
    Unloaded,
    Loaded { entries: usize },
    Stale { reason: String },
}

enum IndexSlot {
    Unloaded,
    Loaded(VectorIndex),
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Removal {
    Removed { fingerprint: Fingerprint },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Insertion {
    pub fingerprint: Fingerprint,
    /// An entry for the same identity existed and was overwritten
    pub replaced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub identity: String,
    pub fingerprint: Fingerprint,
    pub score: f32,
    pub metadata: EntryMetadata,
}

pub struct IndexManager {
    slot: RwLock<IndexSlot>,
    artifacts: ArtifactStore,
    storage: VectorStorage,
    embedder: Arc<dyn Embedder>,
}

impl IndexManager {
    /// Prepare directories. Nothing is loaded until the first call that
    /// needs the index.
    pub fn init(armory_dir: PathBuf, index_dir: PathBuf, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        for dir in [&armory_dir, &index_dir] {
            std::fs::create_dir_all(dir).map_err(|source| {
                IndexError::Artifact(ArtifactError::Io {
                    path: dir.clone(),
                    source,
                })
            })?;
        }

        log::info!(
            "index manager ready artifacts={} snapshot={} model={}",
            armory_dir.display(),
            index_dir.join(SNAPSHOT_FILE).display(),
            embedder.model_id()
        );

        Ok(Self {
            slot: RwLock::new(IndexSlot::Unloaded),
            artifacts: ArtifactStore::new(armory_dir),
            storage: VectorStorage::new(index_dir.join(SNAPSHOT_FILE)),
            embedder,
        })
    }

    /// Flush the snapshot of a loaded index and release the handle.
    pub fn teardown(self) -> Result<(), IndexError> {
        let slot = self.slot.into_inner().map_err(|_| IndexError::Poisoned)?;
        if let IndexSlot::Loaded(index) = slot {
            self.storage.save(&index, &self.embedder.model_id_hash())?;
            log::info!("index torn down with {} entries", index.len());
        }
        Ok(())
    }

    pub fn state(&self) -> IndexState {
        match self.slot.read() {
            Ok(slot) => match &*slot {
                IndexSlot::Unloaded => IndexState::Unloaded,
                IndexSlot::Loaded(index) => IndexState::Loaded { entries: index.len() },
                IndexSlot::Stale { reason } => IndexState::Stale { reason: reason.clone() },
            },
            Err(_) => IndexState::Stale {
                reason: "index lock poisoned".into(),
            },
        }
    }

    /// Index or re-index a record, replacing any entry for the same identity.
    pub fn insert(&self, record: &Record) -> Result<Insertion, IndexError> {
        let identity = validate_identity(record.identity())?;
        let fp = record.fingerprint();
        let embedding = self.embed_checked(&record.canonical_text())?;

        let mut guard = self.write_loaded()?;
        let IndexSlot::Loaded(index) = &mut *guard else {
            return Err(IndexError::Poisoned);
        };

        if let Some(existing) = index.get(&fp) {
            if existing.identity != identity {
                let err = IndexError::ConsistencyViolation {
                    identity: identity.to_string(),
                    fingerprint: fp,
                    existing: existing.identity.clone(),
                };
                log::error!("{err}");
                *guard = IndexSlot::Stale { reason: err.to_string() };
                return Err(err);
            }
        }

        let replaced = index.remove(&fp).is_some();
        let seq = index.insert(fp, identity.to_string(), record.entry_metadata(), embedding)?;

        if let Err(e) = self.artifacts.write(record) {
            *guard = IndexSlot::Stale {
                reason: format!("artifact write failed: {e}"),
            };
            return Err(e.into());
        }
        self.persist(&mut guard)?;

        log::info!(
            "indexed identity={identity} fingerprint={} seq={seq} replaced={replaced} degraded={}",
            fp.short(),
            record.is_degraded()
        );
        Ok(Insertion {
            fingerprint: fp,
            replaced,
        })
    }

    pub fn delete(&self, identity: &str) -> Result<Removal, IndexError> {
        let identity = validate_identity(identity)?;
        let fp = fingerprint(identity);

        let mut guard = self.write_loaded()?;
        let IndexSlot::Loaded(index) = &mut *guard else {
            return Err(IndexError::Poisoned);
        };

        if let Some(existing) = index.get(&fp) {
            if existing.identity != identity {
                return Err(IndexError::ConsistencyViolation {
                    identity: identity.to_string(),
                    fingerprint: fp,
                    existing: existing.identity.clone(),
                });
            }
        }

        let had_entry = index.remove(&fp).is_some();
        let had_artifact = match self.artifacts.remove(&fp) {
            Ok(existed) => existed,
            Err(e) => {
                *guard = IndexSlot::Stale {
                    reason: format!("artifact removal failed: {e}"),
                };
                return Err(e.into());
            }
        };

        if !had_entry && !had_artifact {
            log::debug!("delete identity={identity} outcome=not_found");
            return Ok(Removal::NotFound);
        }

        self.persist(&mut guard)?;
        log::info!("deleted identity={identity} fingerprint={}", fp.short());
        Ok(Removal::Removed { fingerprint: fp })
    }

    /// Rebuild the index from artifacts and persist it. Returns the entry count.
    pub fn rebuild(&self) -> Result<usize, IndexError> {
        let mut guard = self.slot.write().map_err(|_| IndexError::Poisoned)?;
        self.rebuild_locked(&mut guard)
    }

    pub fn search(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if text.trim().is_empty() {
            return Err(IndexError::Validation("query text must not be empty".into()));
        }
        if k == 0 || self.len()? == 0 {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(text)?;
        self.with_loaded(|index| -> Result<Vec<SearchHit>, IndexError> {
            if index.is_empty() {
                return Ok(Vec::new());
            }
            let hits = index
                .search(&query, k)?
                .into_iter()
                .map(|scored| SearchHit {
                    identity: scored.entry.identity.clone(),
                    fingerprint: scored.fingerprint,
                    score: scored.score,
                    metadata: scored.entry.metadata.clone(),
                })
                .collect();
            Ok(hits)
        })?
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        self.with_loaded(|index| index.len())
    }

    pub fn contains(&self, identity: &str) -> Result<bool, IndexError> {
        let fp = fingerprint(identity);
        self.with_loaded(|index| index.get(&fp).is_some_and(|e| e.identity == identity))
    }

    /// Stored record for `identity`, read from its artifact.
    pub fn get_record(&self, identity: &str) -> Result<Option<Record>, IndexError> {
        let identity = validate_identity(identity)?;
        let record = self.artifacts.read(&fingerprint(identity))?;
        Ok(record.filter(|r| r.identity() == identity))
    }

    fn embed_checked(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let embedding = self.embedder.embed(text)?;
        if embedding.len() != self.embedder.dimensions() {
            return Err(VectorError::DimensionMismatch {
                expected: self.embedder.dimensions(),
                got: embedding.len(),
            }
            .into());
        }
        Ok(embedding)
    }

    /// Run `f` against a loaded index, loading or rebuilding first if needed.
    fn with_loaded<R>(&self, f: impl Fn(&VectorIndex) -> R) -> Result<R, IndexError> {
        for _ in 0..2 {
            {
                let slot = self.slot.read().map_err(|_| IndexError::Poisoned)?;
                if let IndexSlot::Loaded(index) = &*slot {
                    return Ok(f(index));
                }
            }
            drop(self.write_loaded()?);
        }

        match &*self.slot.read().map_err(|_| IndexError::Poisoned)? {
            IndexSlot::Loaded(index) => Ok(f(index)),
            IndexSlot::Stale { reason } => Err(IndexError::Validation(format!("index is stale: {reason}"))),
            IndexSlot::Unloaded => Err(IndexError::Validation("index is not loaded".into())),
        }
    }

    /// Write guard over a slot that is guaranteed to be `Loaded`.
    fn write_loaded(&self) -> Result<RwLockWriteGuard<'_, IndexSlot>, IndexError> {
        let mut guard = self.slot.write().map_err(|_| IndexError::Poisoned)?;
        let stale_reason = match &*guard {
            IndexSlot::Loaded(_) => return Ok(guard),
            IndexSlot::Unloaded => None,
            IndexSlot::Stale { reason } => Some(reason.clone()),
        };

        match stale_reason {
            None => self.load_locked(&mut guard)?,
            Some(reason) => {
                log::info!("index is stale ({reason}), rebuilding");
                self.rebuild_locked(&mut guard)?;
            }
        }
        Ok(guard)
    }

    fn load_locked(&self, slot: &mut IndexSlot) -> Result<(), IndexError> {
        if !self.storage.exists() {
            log::info!("no snapshot at {}, rebuilding from artifacts", self.storage.path().display());
            self.rebuild_locked(slot)?;
            return Ok(());
        }

        let loaded = self
            .storage
            .load(&self.embedder.model_id_hash(), self.embedder.dimensions());
        match loaded {
            Ok(index) => {
                let artifacts = self.artifacts.scan()?.len();
                if artifacts != index.len() {
                    log::warn!(
                        "snapshot has {} entries but {artifacts} artifacts exist, rebuilding",
                        index.len()
                    );
                    self.rebuild_locked(slot)?;
                } else {
                    log::info!("loaded {} vectors from snapshot", index.len());
                    *slot = IndexSlot::Loaded(index);
                }
            }
            Err(e) => {
                log::warn!("snapshot unusable ({e}), rebuilding from artifacts");
                self.rebuild_locked(slot)?;
            }
        }
        Ok(())
    }

    fn rebuild_locked(&self, slot: &mut IndexSlot) -> Result<usize, IndexError> {
        let mut records = self.artifacts.scan()?;
        // stable order so sequence numbers do not depend on directory listing
        records.sort_by(|a, b| {
            a.enriched_at()
                .cmp(&b.enriched_at())
                .then_with(|| a.fingerprint().cmp(&b.fingerprint()))
        });

        let mut index = VectorIndex::with_capacity(self.embedder.dimensions(), records.len());
        for record in &records {
            let fp = record.fingerprint();
            if let Some(existing) = index.get(&fp) {
                if existing.identity != record.identity() {
                    let err = IndexError::ConsistencyViolation {
                        identity: record.identity().to_string(),
                        fingerprint: fp,
                        existing: existing.identity.clone(),
                    };
                    *slot = IndexSlot::Stale { reason: err.to_string() };
                    return Err(err);
                }
            }

            // a record that cannot be indexed fails the whole rebuild
            let inserted = self
                .embed_checked(&record.canonical_text())
                .and_then(|embedding| {
                    index
                        .insert(fp, record.identity().to_string(), record.entry_metadata(), embedding)
                        .map_err(IndexError::from)
                });
            if let Err(e) = inserted {
                log::error!("rebuild aborted at {}: {e}", record.identity());
                *slot = IndexSlot::Stale {
                    reason: format!("rebuild failed at {}: {e}", record.identity()),
                };
                return Err(e);
            }
        }

        if let Err(e) = self.storage.save(&index, &self.embedder.model_id_hash()) {
            *slot = IndexSlot::Stale {
                reason: format!("snapshot write failed: {e}"),
            };
            return Err(e.into());
        }

        let count = index.len();
        log::info!("rebuilt index with {count} entries from {} artifacts", records.len());
        *slot = IndexSlot::Loaded(index);
        Ok(count)
    }

    fn persist(&self, slot: &mut IndexSlot) -> Result<(), IndexError> {
        let IndexSlot::Loaded(index) = &*slot else {
            return Ok(());
        };
        if let Err(e) = self.storage.save(index, &self.embedder.model_id_hash()) {
            log::error!("snapshot write failed: {e}");
            *slot = IndexSlot::Stale {
                reason: format!("snapshot write failed: {e}"),
            };
            return Err(e.into());
        }
        Ok(())
    }
}

fn validate_identity(identity: &str) -> Result<&str, IndexError> {
    if identity.trim().is_empty() {
        return Err(IndexError::Validation("identity must not be empty".into()));
    }
    Ok(identity)
}
