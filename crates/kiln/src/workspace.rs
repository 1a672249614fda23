use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    ".kiln".into()
}

fn default_engine_dir() -> String {
    "engine".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    /// Drop the build dir (downloads, hash cache, staging) before the run.
    Build,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    /// The unpacked browser engine source tree.
    #[serde(default = "default_engine_dir")]
    pub engine_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            engine_dir: default_engine_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub engine_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths are used as-is; relative ones are rooted at the workspace root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let p = PathBuf::from(raw);
        Ok(if p.is_absolute() { p } else { self.root.join(p) })
    }

    pub fn hash_cache_file(&self) -> PathBuf {
        self.build_dir.join("hash-cache.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.build_dir.join("downloads")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.build_dir.join("staging")
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_dir.join("error-logs")
    }
}

pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let root = rooted(base, &cfg.root_dir)?;
    let build_dir = rooted(&root, &relative_dir(&cfg.build_dir)?)?;
    let engine_dir = rooted(&root, &cfg.engine_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        engine_dir,
    })
}

/// Resolves paths relative to `base` (usually the build definition's directory),
/// applies the clean mode and makes sure the build dir exists.
pub fn init_dirs(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, base)?;
    if cfg.clean == CleanMode::Build {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }
    fs::create_dir_all(&paths.build_dir).map_err(|e| {
        Error::io(format!(
            "failed to create build dir {}: {e}",
            paths.build_dir.display()
        ))
    })?;
    Ok(paths)
}

fn relative_dir(p: &str) -> Result<String> {
    let p = p.trim();
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    Ok(p.to_string())
}

fn rooted(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

/// Removes `dir` only when it lives under `root`.
pub fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::precondition(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::io(format!("failed to remove {}: {e}", dir_can.display())))
}
