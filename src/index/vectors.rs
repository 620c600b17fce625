//! Fingerprint-keyed vectors searched by cosine similarity.
//!
//! Entries are keyed by fingerprint and carry the insertion sequence used to
//! break score ties (most recent first). The per-entry metadata type is a
//! parameter: repository cards use `EntryMetadata`, codebase chunks their own.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::fingerprint::Fingerprint;
use crate::record::EntryMetadata;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry<M = EntryMetadata> {
    pub identity: String,
    pub insertion_seq: u64,
    pub metadata: M,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredEntry<'a, M = EntryMetadata> {
    pub fingerprint: Fingerprint,
    pub entry: &'a VectorEntry<M>,
    pub score: f32,
}

pub struct VectorIndex<M = EntryMetadata> {
    entries: HashMap<Fingerprint, VectorEntry<M>>,
    dimensions: usize,
    next_seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("vector has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("zero-norm vectors cannot be indexed or queried")]
    ZeroNormVector,
}

impl<M> VectorIndex<M> {
    pub fn new(dimensions: usize) -> Self {
        Self::with_capacity(dimensions, 0)
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
            next_seq: 0,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number the next insert will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Insert with a fresh sequence number, replacing any entry under the
    /// same fingerprint.
    pub fn insert(
        &mut self,
        fingerprint: Fingerprint,
        identity: String,
        metadata: M,
        embedding: Vec<f32>,
    ) -> Result<u64, VectorError> {
        let seq = self.next_seq;
        self.insert_with_seq(fingerprint, identity, seq, metadata, embedding)?;
        Ok(seq)
    }

    /// Insert keeping a known sequence number, used when loading a snapshot.
    pub fn insert_with_seq(
        &mut self,
        fingerprint: Fingerprint,
        identity: String,
        insertion_seq: u64,
        metadata: M,
        embedding: Vec<f32>,
    ) -> Result<(), VectorError> {
        if embedding.len() != self.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if l2_norm(&embedding) < f32::EPSILON {
            return Err(VectorError::ZeroNormVector);
        }

        self.entries.insert(
            fingerprint,
            VectorEntry {
                identity,
                insertion_seq,
                metadata,
                embedding,
            },
        );
        self.next_seq = self.next_seq.max(insertion_seq + 1);
        Ok(())
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<VectorEntry<M>> {
        self.entries.remove(fingerprint)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&VectorEntry<M>> {
        self.entries.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &VectorEntry<M>)> {
        self.entries.iter()
    }

    /// Top `limit` entries by cosine similarity.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<ScoredEntry<'_, M>>, VectorError> {
        if query.len() != self.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(VectorError::ZeroNormVector);
        }

        let mut results: Vec<ScoredEntry<'_, M>> = self
            .entries
            .iter()
            .map(|(fingerprint, entry)| ScoredEntry {
                fingerprint: *fingerprint,
                entry,
                score: cosine_similarity(query, &entry.embedding, query_norm),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.entry.insertion_seq.cmp(&a.entry.insertion_seq))
        });
        results.truncate(limit);

        Ok(results)
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot / (query_norm * target_norm)
}
