//! Binary snapshot of the vector index.
//!
//! Layout of `vectors.bin`:
//!
//! Header (47 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 of the embedding model id)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the header fields before it)
//!
//! Entries (repeated):
//! - fingerprint: [u8; 32]
//! - insertion_seq: u64 (little-endian)
//! - identity: u32 length + UTF-8 bytes
//! - metadata: u32 length + JSON bytes
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::fingerprint::Fingerprint;
use crate::index::vectors::{VectorEntry, VectorIndex};
use crate::record::EntryMetadata;

const FORMAT_VERSION: u8 = 2;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Upper bound on identity/metadata blobs, guards against reading garbage lengths.
const MAX_BLOB_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed snapshot: {0}")]
    InvalidFormat(String),

    #[error("snapshot format v{0} is not v{1}")]
    VersionMismatch(u8, u8),

    #[error("snapshot was built with another embedding model")]
    ModelMismatch,

    #[error("snapshot header checksum does not match")]
    ChecksumMismatch,

    #[error("snapshot holds {got}-dimensional vectors, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Snapshot file for a `VectorIndex<M>`; `M` is stored as JSON per entry.
pub struct VectorStorage<M = EntryMetadata> {
    path: PathBuf,
    _metadata: PhantomData<fn() -> M>,
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl<M> VectorStorage<M> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _metadata: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl<M: Serialize + DeserializeOwned> VectorStorage<M> {
    /// Load a snapshot written for the same model and dimensions.
    pub fn load(&self, expected_model_id: &[u8; 32], expected_dimensions: usize) -> Result<VectorIndex<M>, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let dimensions = header.dimensions as usize;
        let capacity = header.entry_count.min(1 << 16) as usize;
        let mut index = VectorIndex::with_capacity(dimensions, capacity);

        for _ in 0..header.entry_count {
            let (fingerprint, entry) = read_entry(&mut reader, dimensions)?;
            let VectorEntry {
                identity,
                insertion_seq,
                metadata,
                embedding,
            } = entry;
            if let Err(e) = index.insert_with_seq(fingerprint, identity, insertion_seq, metadata, embedding) {
                log::warn!("skipping snapshot entry {}: {e}", fingerprint.short());
            }
        }

        // trailing bytes mean the entry count lied
        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorStorageError::InvalidFormat("trailing data after last entry".into()));
        }

        Ok(index)
    }

    /// Atomic write: temp file, fsync, rename.
    pub fn save(&self, index: &VectorIndex<M>, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(VectorStorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("snapshot directory {} does not exist", parent.display()),
                )));
            }
        }

        let temp_path = self.path.with_extension("tmp");
        if let Err(e) = write_to_file(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn write_to_file<M: Serialize>(path: &Path, index: &VectorIndex<M>, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
    let dimensions = u16::try_from(index.dimensions())
        .map_err(|_| VectorStorageError::InvalidFormat(format!("{} dimensions do not fit the header", index.dimensions())))?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_header(
        &mut writer,
        &Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
        },
    )?;

    // sequence order keeps snapshots byte-stable for the same content
    let mut entries: Vec<_> = index.iter().collect();
    entries.sort_by_key(|(_, entry)| entry.insertion_seq);
    for (fingerprint, entry) in entries {
        write_entry(&mut writer, fingerprint, entry)?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(take(&bytes[43..47])?);
    if stored_checksum != crc32fast::hash(&bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);

    Ok(Header {
        version,
        model_id,
        dimensions: u16::from_le_bytes(take(&bytes[33..35])?),
        entry_count: u64::from_le_bytes(take(&bytes[35..43])?),
    })
}

fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<(), VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..43]);
    bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_entry<R: Read, M: DeserializeOwned>(
    reader: &mut R,
    dimensions: usize,
) -> Result<(Fingerprint, VectorEntry<M>), VectorStorageError> {
    let mut fp = [0u8; 32];
    reader.read_exact(&mut fp)?;

    let mut seq = [0u8; 8];
    reader.read_exact(&mut seq)?;

    let identity = String::from_utf8(read_blob(reader)?)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("identity is not UTF-8: {e}")))?;
    let metadata: M = serde_json::from_slice(&read_blob(reader)?)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("bad entry metadata: {e}")))?;

    let mut embedding = Vec::with_capacity(dimensions);
    let mut float = [0u8; 4];
    for _ in 0..dimensions {
        reader.read_exact(&mut float)?;
        embedding.push(f32::from_le_bytes(float));
    }

    Ok((
        Fingerprint::from_bytes(fp),
        VectorEntry {
            identity,
            insertion_seq: u64::from_le_bytes(seq),
            metadata,
            embedding,
        },
    ))
}

fn write_entry<W: Write, M: Serialize>(
    writer: &mut W,
    fingerprint: &Fingerprint,
    entry: &VectorEntry<M>,
) -> Result<(), VectorStorageError> {
    writer.write_all(fingerprint.as_bytes())?;
    writer.write_all(&entry.insertion_seq.to_le_bytes())?;
    write_blob(writer, entry.identity.as_bytes())?;

    let metadata = serde_json::to_vec(&entry.metadata)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("metadata not serializable: {e}")))?;
    write_blob(writer, &metadata)?;

    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_blob<R: Read>(reader: &mut R) -> Result<Vec<u8>, VectorStorageError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_BLOB_LEN {
        return Err(VectorStorageError::InvalidFormat(format!("blob length {len} too large")));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), VectorStorageError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_BLOB_LEN)
        .ok_or_else(|| VectorStorageError::InvalidFormat(format!("blob of {} bytes too large", bytes.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn take<const N: usize>(slice: &[u8]) -> Result<[u8; N], VectorStorageError> {
    slice
        .try_into()
        .map_err(|_| VectorStorageError::InvalidFormat("short header field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use std::io::{Seek, SeekFrom};

    fn model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn meta(name: &str) -> EntryMetadata {
        EntryMetadata {
            repo_name: name.into(),
            url: format!("https://github.com/o/{name}"),
            degraded: name.starts_with('d'),
        }
    }

    fn storage_at(path: PathBuf) -> VectorStorage {
        VectorStorage::new(path)
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(3);
        for (name, v) in [("a", [1.0, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0]), ("dz", [0.0, 0.0, 1.0])] {
            index.insert(fingerprint(name), name.into(), meta(name), v.to_vec()).unwrap();
        }
        index
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_at(tmp.path().join("vectors.bin"));

        storage.save(&VectorIndex::new(384), &model_id()).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id(), 384).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions(), 384);
    }

    #[test]
    fn test_save_and_load_preserves_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_at(tmp.path().join("vectors.bin"));
        let index = sample_index();

        storage.save(&index, &model_id()).unwrap();
        let loaded = storage.load(&model_id(), 3).unwrap();

        assert_eq!(loaded.len(), 3);
        for (fp, entry) in index.iter() {
            assert_eq!(loaded.get(fp), Some(entry));
        }
        assert_eq!(loaded.next_seq(), index.next_seq());
    }

    #[test]
    fn test_model_and_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_at(tmp.path().join("vectors.bin"));
        storage.save(&sample_index(), &model_id()).unwrap();

        assert!(matches!(storage.load(&[0xFF; 32], 3), Err(VectorStorageError::ModelMismatch)));
        assert!(matches!(
            storage.load(&model_id(), 384),
            Err(VectorStorageError::DimensionMismatch { expected: 384, got: 3 })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = storage_at(path.clone());
        storage.save(&sample_index(), &model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(storage.load(&model_id(), 3), Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = storage_at(path.clone());
        storage.save(&sample_index(), &model_id()).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        assert!(storage.load(&model_id(), 3).is_err());
    }

    #[test]
    fn test_old_version_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&[0u8; HEADER_SIZE - 1]);
        std::fs::write(&path, bytes).unwrap();

        let storage = storage_at(path);
        assert!(matches!(storage.load(&model_id(), 3), Err(VectorStorageError::VersionMismatch(1, 2))));
    }

    #[test]
    fn test_save_into_missing_dir_cleans_up() {
        let path = PathBuf::from("/nonexistent/directory/vectors.bin");
        let storage = storage_at(path.clone());

        assert!(storage.save(&VectorIndex::new(3), &model_id()).is_err());
        assert!(!path.with_extension("tmp").exists());
    }
}
