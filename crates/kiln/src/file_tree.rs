use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::dispatch::to_unix_path;
use crate::error::{Error, Result};

/// A snapshot of a directory: relative `/`-separated path -> file bytes.
///
/// Tree transforms take and return `FileTree`s so they can be exercised without a
/// real filesystem; `load` and `store` are the only parts that touch disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(normalize_key(&rel.into()), bytes.into());
    }

    pub fn get(&self, rel: &str) -> Option<&[u8]> {
        self.files.get(&normalize_key(rel)).map(Vec::as_slice)
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.files.contains_key(&normalize_key(rel))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Reads every regular file below `root`. A missing root is an empty tree.
    pub fn load(root: &Path) -> Result<Self> {
        let mut tree = Self::new();
        if !root.exists() {
            return Ok(tree);
        }
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::io(format!("path outside {}: {e}", root.display())))?;
            let bytes = fs::read(entry.path()).map_err(|e| {
                Error::io(format!("failed to read {}: {e}", entry.path().display()))
            })?;
            tree.files.insert(to_unix_path(rel), bytes);
        }
        Ok(tree)
    }

    /// Writes every file below `root`, creating parents. Returns the written paths.
    pub fn store(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.files.len());
        for (rel, bytes) in &self.files {
            let dst = rel.split('/').fold(root.to_path_buf(), |p, seg| p.join(seg));
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::io(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            fs::write(&dst, bytes)
                .map_err(|e| Error::io(format!("failed to write {}: {e}", dst.display())))?;
            written.push(dst);
        }
        Ok(written)
    }
}

fn normalize_key(rel: &str) -> String {
    rel.replace('\\', "/").trim_start_matches('/').to_string()
}

impl FromIterator<(String, Vec<u8>)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut tree = Self::new();
        for (k, v) in iter {
            tree.insert(k, v);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized() {
        let mut t = FileTree::new();
        t.insert("locales\\en-US\\brand.ftl", "x");
        assert!(t.contains("/locales/en-US/brand.ftl"));
        assert_eq!(t.paths().collect::<Vec<_>>(), vec!["locales/en-US/brand.ftl"]);
    }

    #[test]
    fn store_then_load_mirrors_layout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut t = FileTree::new();
        t.insert("a.txt", "one");
        t.insert("nested/deeper/b.css", "two");
        let written = t.store(tmp.path()).expect("store");
        assert_eq!(written.len(), 2);
        assert!(tmp.path().join("nested").join("deeper").join("b.css").is_file());

        let back = FileTree::load(tmp.path()).expect("load");
        assert_eq!(back, t);
        assert!(FileTree::load(&tmp.path().join("nope")).expect("missing").is_empty());
    }
}
