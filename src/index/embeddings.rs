//! Embedding models.
//!
//! - `FastEmbedder` wraps fastembed and downloads its model on first use
//! - `HashingEmbedder` is a deterministic bag-of-words feature hasher for
//!   offline use and tests

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

const HASHING_PREFIX: &str = "hashing-";

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("could not load embedding model: {0}")]
    InitFailed(String),

    #[error("could not embed text: {0}")]
    EmbeddingFailed(String),

    #[error("unknown embedding model: {0}")]
    InvalidModel(String),
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    fn model_id(&self) -> &str;

    /// SHA256 of the model id, stamped into snapshots.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id().as_bytes());
        hasher.finalize().into()
    }
}

/// Build the embedder named by `model`.
pub fn embedder_for(model: &str, models_dir: PathBuf) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    if let Some(dims) = model.strip_prefix(HASHING_PREFIX) {
        let dims: usize = dims
            .parse()
            .map_err(|_| EmbeddingError::InvalidModel(format!("{model}: expected {HASHING_PREFIX}<dimensions>")))?;
        return Ok(Arc::new(HashingEmbedder::new(dims)?));
    }

    Ok(Arc::new(FastEmbedder::new(model, models_dir)?))
}

/// fastembed's `embed()` needs `&mut self`, hence the mutex.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedder {
    pub fn new(model_name: &str, models_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        std::fs::create_dir_all(&models_dir)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to create models directory: {e}")))?;

        log::info!("loading embedding model '{model_name}'");
        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        let mut model = TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
        let dimensions = detect_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {e}")))?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("model produced no vector".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {name}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, {HASHING_PREFIX}<dimensions>"
        ))),
    }
}

fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {e}")))?
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("test embedding produced no vector".to_string()))
}

/// Signed feature hashing over lowercase word tokens, L2-normalized.
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Result<Self, EmbeddingError> {
        if dimensions == 0 || dimensions > u16::MAX as usize {
            return Err(EmbeddingError::InvalidModel(format!(
                "{HASHING_PREFIX}{dimensions}: dimensions must be between 1 and {}",
                u16::MAX
            )));
        }
        Ok(Self {
            dimensions,
            model_id: format!("{HASHING_PREFIX}{dimensions}"),
        })
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(word);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((h % self.dimensions as u64) as usize, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            let trimmed = lowered.trim();
            if trimmed.is_empty() {
                return Err(EmbeddingError::EmbeddingFailed("cannot embed empty text".into()));
            }
            tokens.push(trimmed);
        }

        let mut vector = vec![0f32; self.dimensions];
        for token in tokens {
            let (idx, sign) = self.bucket(token);
            vector[idx] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            // every token cancelled out; fall back to the whole text
            let (idx, sign) = self.bucket(&lowered);
            vector[idx] = sign;
            return Ok(vector);
        }
        for x in vector.iter_mut() {
            *x /= norm;
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let a = embedder.embed("Fast recursive grep").unwrap();
        let b = embedder.embed("fast RECURSIVE grep!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_similarity_tracks_overlap() {
        let embedder = HashingEmbedder::new(256).unwrap();
        let query = embedder.embed("vector search engine").unwrap();
        let close = embedder.embed("a vector search engine in rust").unwrap();
        let far = embedder.embed("terminal colour themes").unwrap();
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn test_hashing_rejects_empty_text() {
        let embedder = HashingEmbedder::new(8).unwrap();
        assert!(embedder.embed("   ").is_err());
        assert!(embedder.embed("???").is_ok());
    }

    #[test]
    fn test_embedder_for_hashing_model() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = embedder_for("hashing-32", tmp.path().to_path_buf()).unwrap();
        assert_eq!(embedder.dimensions(), 32);
        assert_eq!(embedder.model_id(), "hashing-32");
        assert_ne!(embedder.model_id_hash(), HashingEmbedder::new(64).unwrap().model_id_hash());

        assert!(matches!(
            embedder_for("hashing-abc", tmp.path().to_path_buf()),
            Err(EmbeddingError::InvalidModel(_))
        ));
        assert!(matches!(
            embedder_for("nonexistent-model", tmp.path().to_path_buf()),
            Err(EmbeddingError::InvalidModel(_))
        ));
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_fastembed_model() {
        let tmp = tempfile::tempdir().unwrap();
        let model = FastEmbedder::new("all-MiniLM-L6-v2", tmp.path().join("models")).unwrap();
        assert_eq!(model.dimensions(), 384);
        assert_eq!(model.embed("Hello, world!").unwrap().len(), 384);
    }
}
