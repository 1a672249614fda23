//! Version-control engine seam. The pipeline never parses diffs itself; it asks the
//! engine to apply or reverse a patch file and reads back success plus diagnostics.

use std::path::Path;

use crate::dispatch::{Captured, DispatchOptions, dispatch_capture, to_unix_path};
use crate::error::{Error, Result};
use crate::logging::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

pub trait VersionControl: Send + Sync {
    fn init(&self, tree: &Path) -> Result<()>;
    fn checkout_orphan(&self, tree: &Path, branch: &str) -> Result<()>;
    fn configure(&self, tree: &Path, key: &str, value: &str) -> Result<()>;
    fn add_all(&self, tree: &Path) -> Result<()>;
    fn commit(&self, tree: &Path, message: &str) -> Result<()>;
    fn create_branch(&self, tree: &Path, name: &str) -> Result<()>;
    /// Stages `path` and commits it alone, leaving other changes in `tree` untouched.
    /// Returns false when nothing under `path` changed.
    fn commit_path(&self, tree: &Path, path: &Path, message: &str) -> Result<bool>;

    /// Applies (or reverses) `patch` against `tree`. Engine failure is not an error
    /// here: the returned capture carries success and the raw diagnostic.
    fn apply_patch(
        &self,
        tree: &Path,
        patch: &Path,
        direction: Direction,
        flags: &[String],
    ) -> Result<Captured>;

    /// Discards staged and unstaged changes to tracked files.
    fn reset(&self, tree: &Path) -> Result<()>;
    /// Removes untracked and ignored files.
    fn clean(&self, tree: &Path) -> Result<()>;
}

/// `git` driven through the dispatcher.
pub struct GitEngine {
    git: String,
    log: Log,
    opts: DispatchOptions,
}

impl GitEngine {
    pub fn new(git: impl Into<String>, log: Log, opts: DispatchOptions) -> Self {
        Self {
            git: git.into(),
            log,
            opts,
        }
    }

    fn run(&self, tree: &Path, args: &[&str]) -> Result<Captured> {
        let opts = self.opts.clone().cwd(tree);
        dispatch_capture(&self.log, &self.git, args, &opts)
    }

    fn run_ok(&self, tree: &Path, args: &[&str]) -> Result<()> {
        let out = self.run(tree, args)?;
        if out.success {
            return Ok(());
        }
        Err(Error::engine(
            &format!("git {} failed in {}", args.join(" "), tree.display()),
            &out.diagnostic(),
        ))
    }
}

impl VersionControl for GitEngine {
    fn init(&self, tree: &Path) -> Result<()> {
        self.run_ok(tree, &["init"])
    }

    fn checkout_orphan(&self, tree: &Path, branch: &str) -> Result<()> {
        self.run_ok(tree, &["checkout", "--orphan", branch])
    }

    fn configure(&self, tree: &Path, key: &str, value: &str) -> Result<()> {
        self.run_ok(tree, &["config", key, value])
    }

    fn add_all(&self, tree: &Path) -> Result<()> {
        self.run_ok(tree, &["add", "-f", "."])
    }

    fn commit(&self, tree: &Path, message: &str) -> Result<()> {
        self.run_ok(tree, &["commit", "-aqm", message])
    }

    fn create_branch(&self, tree: &Path, name: &str) -> Result<()> {
        self.run_ok(tree, &["checkout", "-b", name])
    }

    fn commit_path(&self, tree: &Path, path: &Path, message: &str) -> Result<bool> {
        let rel = to_unix_path(path.strip_prefix(tree).unwrap_or(path));
        let rel = if rel.is_empty() { ".".to_string() } else { rel };
        self.run_ok(tree, &["add", "-f", "--", &rel])?;
        let staged = self.run(tree, &["diff", "--cached", "--quiet", "--", &rel])?;
        match staged.status {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => {
                return Err(Error::engine(
                    &format!("git diff --cached failed in {}", tree.display()),
                    &staged.diagnostic(),
                ));
            }
        }
        self.run_ok(tree, &["commit", "-qm", message, "--", &rel])?;
        Ok(true)
    }

    fn apply_patch(
        &self,
        tree: &Path,
        patch: &Path,
        direction: Direction,
        flags: &[String],
    ) -> Result<Captured> {
        let patch = to_unix_path(patch);
        let mut args: Vec<&str> = vec!["apply"];
        if direction == Direction::Reverse {
            args.push("-R");
        }
        args.extend(flags.iter().map(String::as_str));
        args.push(&patch);
        self.run(tree, &args)
    }

    fn reset(&self, tree: &Path) -> Result<()> {
        self.run_ok(tree, &["reset", "-q"])?;
        self.run_ok(tree, &["checkout", "."])
    }

    fn clean(&self, tree: &Path) -> Result<()> {
        self.run_ok(tree, &["clean", "-fdx"])
    }
}
