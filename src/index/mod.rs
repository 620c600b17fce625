//! Similarity index over enriched records.
//!
//! # Architecture
//!
//! - `embeddings`: embedding models (fastembed, feature hashing)
//! - `vectors`: in-memory vector map with cosine search
//! - `storage`: binary vectors.bin snapshot
//! - `artifacts`: one JSON file per identity, the durable source of truth
//! - `manager`: lifecycle, locking and persistence of all of the above

pub mod artifacts;
pub mod embeddings;
pub mod manager;
pub mod storage;
pub mod vectors;

pub use embeddings::{embedder_for, Embedder, EmbeddingError, FastEmbedder, HashingEmbedder};
pub use manager::{IndexError, IndexManager, IndexState, Insertion, Removal, SearchHit};
