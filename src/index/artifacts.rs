//! Durable per-identity JSON artifacts, the source of truth for rebuilds.

use std::path::{Path, PathBuf};

use crate::fingerprint::Fingerprint;
use crate::record::{Record, Searchable};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {path} is not a valid record: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.to_hex()))
    }

    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.path_for(fingerprint).exists()
    }

    /// Replace the artifact for the record's fingerprint.
    pub fn write(&self, record: &Record) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ArtifactError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(&record.fingerprint());
        let json = serde_json::to_vec_pretty(record).map_err(|source| ArtifactError::Parse {
            path: path.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        let io_err = |source| ArtifactError::Io {
            path: path.clone(),
            source,
        };
        if let Err(e) = std::fs::write(&tmp, &json) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        std::fs::rename(&tmp, &path).map_err(io_err)?;

        Ok(path)
    }

    pub fn read(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, ArtifactError> {
        let path = self.path_for(fingerprint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ArtifactError::Io { path, source }),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ArtifactError::Parse { path, source })
    }

    /// Returns whether an artifact existed.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, ArtifactError> {
        let path = self.path_for(fingerprint);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ArtifactError::Io { path, source }),
        }
    }

    /// Every readable artifact. Unparseable files are logged and skipped.
    pub fn scan(&self) -> Result<Vec<Record>, ArtifactError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record: Record = match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("skipping artifact {}: {e}", path.display());
                    continue;
                }
            };

            let expected = self.path_for(&record.fingerprint());
            if path != expected {
                log::warn!(
                    "artifact {} does not match its identity {}, indexing it under {}",
                    path.display(),
                    record.identity(),
                    expected.display()
                );
            }
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    #[test]
    fn test_write_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("armory"));
        let record = Record::degraded("https://github.com/a/b", "offline");
        let fp = fingerprint("https://github.com/a/b");

        let path = store.write(&record).unwrap();
        assert_eq!(path, tmp.path().join("armory").join(format!("{fp}.json")));
        assert_eq!(store.read(&fp).unwrap(), Some(record));

        assert!(store.remove(&fp).unwrap());
        assert!(!store.remove(&fp).unwrap());
        assert_eq!(store.read(&fp).unwrap(), None);
    }

    #[test]
    fn test_scan_skips_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().to_path_buf());
        store.write(&Record::degraded("https://github.com/a/one", "x")).unwrap();
        store.write(&Record::degraded("https://github.com/a/two", "x")).unwrap();
        std::fs::write(tmp.path().join("broken.json"), b"{").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"hello").unwrap();

        let mut identities: Vec<String> = store
            .scan()
            .unwrap()
            .iter()
            .map(|r| r.identity().to_string())
            .collect();
        identities.sort();
        assert_eq!(identities, vec!["https://github.com/a/one", "https://github.com/a/two"]);
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("nope"));
        assert!(store.scan().unwrap().is_empty());
    }
}
