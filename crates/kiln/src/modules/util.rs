use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let mut s = serde_json::to_string_pretty(v)?;
    s.push('\n');
    write_text(p, &s)
}

/// Writes through a sibling temp file so readers never see a partial file.
pub fn write_atomic(p: &Path, bytes: &[u8]) -> Result<()> {
    let dir = p
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to stage {}: {e}", p.display())))?;
    tmp.write_all(bytes)
        .map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())))?;
    tmp.persist(p)
        .map_err(|e| Error::io(format!("failed to replace {}: {}", p.display(), e.error)))?;
    Ok(())
}
