//! Content-digest markers for inputs that have already been turned into outputs.
//!
//! A hit only means "these bytes were processed successfully before"; callers still
//! check that the outputs they would reuse are actually present.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashCacheEntry {
    /// The path the digest was first recorded for; informational only.
    pub path: String,
    pub marked_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<String, HashCacheEntry>,
}

#[derive(Debug)]
pub struct HashCache {
    store: PathBuf,
    entries: BTreeMap<String, HashCacheEntry>,
}

impl HashCache {
    /// Opens the cache persisted at `store`; a missing file is an empty cache.
    pub fn open(store: impl Into<PathBuf>) -> Result<Self> {
        let store = store.into();
        let entries = match fs::read_to_string(&store) {
            Ok(raw) => {
                let file: CacheFile = serde_json::from_str(&raw).map_err(|e| {
                    Error::io(format!("corrupt hash cache {}: {e}", store.display()))
                })?;
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::io(format!(
                    "failed to read hash cache {}: {e}",
                    store.display()
                )));
            }
        };
        Ok(Self { store, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_been_processed(&self, path: &Path) -> Result<bool> {
        Ok(self.entries.contains_key(&file_digest(path)?))
    }

    /// Records the current bytes of `path` and persists the cache.
    pub fn mark_processed(&mut self, path: &Path) -> Result<()> {
        let digest = file_digest(path)?;
        self.entries.entry(digest).or_insert_with(|| HashCacheEntry {
            path: crate::dispatch::to_unix_path(path),
            marked_at: chrono::Utc::now().to_rfc3339(),
        });
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let dir = self
            .store
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("failed to create {}: {e}", dir.display())))?;

        let file = CacheFile {
            version: 1,
            entries: self.entries.clone(),
        };
        let body = serde_json::to_vec_pretty(&file)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.flush()?;
        tmp.persist(&self.store).map_err(|e| {
            Error::io(format!(
                "failed to write hash cache {}: {}",
                self.store.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// SHA-256 of the file's bytes, lowercase hex.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
