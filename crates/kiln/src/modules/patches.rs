use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use kiln_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::logging::Log;
use crate::vcs::{Direction, VersionControl};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_dir() -> String {
    "patches".into()
}

fn default_args() -> Vec<String> {
    ["--ignore-space-change", "--ignore-whitespace", "--verbose"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMode {
    /// Stop at the first patch that does not apply.
    #[default]
    Strict,
    /// Record failures and keep going.
    BestEffort,
}

#[Task(
    id = "patches.apply",
    module = "patches",
    phase = "apply",
    provides = ["tree:patched"],
    after = ["core.init", "tree:ready?", "addons:integrated?"],
    default_label = "Apply source patches",
    config_path = "patches"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Patch-set directory, relative to the workspace root.
    #[serde(default = "default_dir")]
    pub dir: String,
    pub mode: PatchMode,
    /// Flags handed to the engine on every apply and reverse call.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Patch path (relative to `dir`, `/`-separated) -> subdirectory of the engine tree.
    pub targets: BTreeMap<String, String>,
}

impl Default for PatchesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            dir: default_dir(),
            mode: PatchMode::Strict,
            args: default_args(),
            targets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub path: PathBuf,
    /// Path relative to the patch-set dir, `/`-separated.
    pub name: String,
    pub order: usize,
    pub target_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The reverse probe matched before the forward apply, so the tree already carried it.
    AlreadyApplied,
    Failed,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        !matches!(self, Outcome::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub descriptor: PatchDescriptor,
    pub outcome: Outcome,
    /// Raw engine output of the forward apply.
    pub diagnostic: String,
}

/// Collects every `*.patch` file below `dir`, ordered by relative path.
pub fn enumerate_patches(
    dir: &Path,
    targets: &BTreeMap<String, String>,
) -> Result<Vec<PatchDescriptor>> {
    if !dir.is_dir() {
        return Err(Error::precondition(format!(
            "patch directory {} does not exist",
            dir.display()
        )));
    }
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("patch") {
            continue;
        }
        let rel = path
            .strip_prefix(dir)
            .map_err(|e| Error::io(format!("patch path outside {}: {e}", dir.display())))?;
        found.push((crate::dispatch::to_unix_path(rel), path.to_path_buf()));
    }
    found.sort();

    if let Some(name) = targets
        .keys()
        .find(|k| !found.iter().any(|(name, _)| name == *k))
    {
        return Err(Error::config(format!(
            "patches.targets names '{name}' but no such patch exists in {}",
            dir.display()
        )));
    }

    Ok(found
        .into_iter()
        .enumerate()
        .map(|(order, (name, path))| PatchDescriptor {
            target_dir: targets.get(&name).map(PathBuf::from),
            path,
            name,
            order,
        })
        .collect())
}

/// Applies `patches` in ascending order. Each patch is first reversed as a probe (its
/// failure ignored), then applied forward. Patches whose content is not idempotent
/// can end up applied twice; that case is reported as `AlreadyApplied` with a warning.
pub fn apply_patch_set(
    vcs: &dyn VersionControl,
    log: &Log,
    patches: &[PatchDescriptor],
    tree: &Path,
    mode: PatchMode,
    flags: &[String],
) -> Result<Vec<ApplyResult>> {
    if !tree.is_dir() {
        return Err(Error::precondition(format!(
            "patch target tree {} does not exist",
            tree.display()
        )));
    }
    let mut ordered: Vec<&PatchDescriptor> = patches.iter().collect();
    ordered.sort_by_key(|p| p.order);

    let mut workdirs = Vec::with_capacity(ordered.len());
    for p in &ordered {
        let dir = match p.target_dir.as_deref() {
            Some(sub) => tree.join(sub),
            None => tree.to_path_buf(),
        };
        if !dir.is_dir() {
            return Err(Error::precondition(format!(
                "target {} for patch '{}' does not exist",
                dir.display(),
                p.name
            )));
        }
        workdirs.push(dir);
    }

    let mut results = Vec::with_capacity(ordered.len());
    for (p, dir) in ordered.into_iter().zip(workdirs) {
        let probe = vcs.apply_patch(&dir, &p.path, Direction::Reverse, flags)?;
        let forward = vcs.apply_patch(&dir, &p.path, Direction::Forward, flags)?;

        let outcome = match (forward.success, probe.success) {
            (false, _) => Outcome::Failed,
            (true, true) => Outcome::AlreadyApplied,
            (true, false) => Outcome::Applied,
        };
        match outcome {
            Outcome::Applied => log.info(&format!("applied {}", p.name)),
            Outcome::AlreadyApplied => log.warning(&format!(
                "{} was already present and has been re-applied; \
                 a patch that is not idempotent in content may now be doubled",
                p.name
            )),
            Outcome::Failed => log.warning(&format!("{} failed to apply", p.name)),
        }
        results.push(ApplyResult {
            descriptor: p.clone(),
            outcome,
            diagnostic: forward.diagnostic(),
        });

        if outcome == Outcome::Failed && mode == PatchMode::Strict {
            break;
        }
    }
    Ok(results)
}

/// Turns the first failed result into an engine error carrying its diagnostic.
pub fn first_failure(results: &[ApplyResult]) -> Result<()> {
    let Some(failed) = results.iter().find(|r| r.outcome == Outcome::Failed) else {
        return Ok(());
    };
    Err(Error::engine(
        &format!("patch '{}' failed to apply", failed.descriptor.name),
        &failed.diagnostic,
    ))
}

impl PatchesConfig {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = ws.resolve(&cfg.dir)?;
        let patches = enumerate_patches(&dir, &cfg.targets)?;
        ctx.log(&format!(
            "{} patch(es) from {} ({:?} mode)",
            patches.len(),
            dir.display(),
            cfg.mode
        ));

        let vcs = ctx.vcs();
        let results = apply_patch_set(
            vcs.as_ref(),
            ctx.logger(),
            &patches,
            &ws.engine_dir,
            cfg.mode,
            &cfg.args,
        )?;

        let applied = results.iter().filter(|r| r.outcome.is_success()).count();
        let failed = results.len() - applied;
        if cfg.mode == PatchMode::BestEffort && failed > 0 {
            for r in results.iter().filter(|r| r.outcome == Outcome::Failed) {
                ctx.logger().warning(&format!(
                    "{}:\n{}",
                    r.descriptor.name,
                    r.diagnostic.trim_end()
                ));
            }
        }
        first_failure(&results).map_err(|e| {
            if cfg.mode == PatchMode::BestEffort {
                e.context(format!("{failed} of {} patch(es) failed", results.len()))
            } else {
                e
            }
        })?;
        ctx.logger().success(&format!("{applied} patch(es) applied"));
        Ok(())
    }
}

#[Module(
    id = "patches",
    config = PatchesConfig,
    config_path = "patches",
    tasks = [PatchesConfig]
)]
pub struct PatchesModule;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    use crate::dispatch::Captured;
    use crate::logging::MemorySink;

    /// Applies patches by name against a set of "present" patches.
    #[derive(Default)]
    struct LedgerVcs {
        present: Mutex<Vec<String>>,
        broken: Vec<String>,
        calls: Mutex<Vec<(String, Direction)>>,
    }

    fn ok(success: bool, line: &str) -> Captured {
        Captured {
            success,
            status: Some(if success { 0 } else { 1 }),
            lines: vec![line.to_string()],
            ..Captured::default()
        }
    }

    impl VersionControl for LedgerVcs {
        fn init(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn checkout_orphan(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        fn configure(&self, _: &Path, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn add_all(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn commit(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        fn create_branch(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        fn commit_path(&self, _: &Path, _: &Path, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn apply_patch(
            &self,
            _tree: &Path,
            patch: &Path,
            direction: Direction,
            _flags: &[String],
        ) -> Result<Captured> {
            let name = patch
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            self.calls
                .lock()
                .expect("lock")
                .push((name.clone(), direction));
            let mut present = self.present.lock().expect("lock");
            match direction {
                Direction::Reverse => match present.iter().position(|p| *p == name) {
                    Some(i) => {
                        present.remove(i);
                        Ok(ok(true, "reversed"))
                    }
                    None => Ok(ok(false, "error: patch does not apply")),
                },
                Direction::Forward => {
                    if self.broken.contains(&name) {
                        return Ok(ok(false, &format!("error: {name}: patch does not apply")));
                    }
                    present.push(name);
                    Ok(ok(true, "applied"))
                }
            }
        }
        fn reset(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn clean(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn descriptors(names: &[&str]) -> Vec<PatchDescriptor> {
        names
            .iter()
            .enumerate()
            .map(|(order, n)| PatchDescriptor {
                path: PathBuf::from(n),
                name: n.to_string(),
                order,
                target_dir: None,
            })
            .collect()
    }

    fn log() -> (Arc<MemorySink>, Log) {
        let sink = Arc::new(MemorySink::default());
        (sink.clone(), Log::new(sink))
    }

    #[test]
    fn second_run_reports_already_applied() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vcs = LedgerVcs::default();
        let (_, log) = log();
        let patches = descriptors(&["a.patch", "b.patch"]);

        let first = apply_patch_set(&vcs, &log, &patches, tmp.path(), PatchMode::Strict, &[])
            .expect("first");
        assert!(first.iter().all(|r| r.outcome == Outcome::Applied));

        let second = apply_patch_set(&vcs, &log, &patches, tmp.path(), PatchMode::Strict, &[])
            .expect("second");
        assert!(second.iter().all(|r| r.outcome == Outcome::AlreadyApplied));
        assert_eq!(
            *vcs.present.lock().expect("lock"),
            vec!["a.patch".to_string(), "b.patch".to_string()]
        );
    }

    #[test]
    fn strict_mode_stops_at_first_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vcs = LedgerVcs {
            broken: vec!["b.patch".into()],
            ..LedgerVcs::default()
        };
        let (_, log) = log();
        let patches = descriptors(&["a.patch", "b.patch", "c.patch"]);
        let results = apply_patch_set(&vcs, &log, &patches, tmp.path(), PatchMode::Strict, &[])
            .expect("apply");

        assert_eq!(results.len(), 2);
        assert_eq!(
            results
                .iter()
                .filter(|r| r.outcome == Outcome::Failed)
                .count(),
            1
        );
        assert!(
            !vcs.calls
                .lock()
                .expect("lock")
                .iter()
                .any(|(n, _)| n == "c.patch")
        );
        let err = first_failure(&results).expect_err("failure");
        assert_eq!(
            err.to_string(),
            "patch 'b.patch' failed to apply\nerror: b.patch: patch does not apply"
        );
    }

    #[test]
    fn best_effort_mode_attempts_every_patch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vcs = LedgerVcs {
            broken: vec!["b.patch".into()],
            ..LedgerVcs::default()
        };
        let (_, log) = log();
        let patches = descriptors(&["a.patch", "b.patch", "c.patch"]);
        let results = apply_patch_set(
            &vcs,
            &log,
            &patches,
            tmp.path(),
            PatchMode::BestEffort,
            &[],
        )
        .expect("apply");

        let outcomes: Vec<Outcome> = results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Applied, Outcome::Failed, Outcome::Applied]
        );
    }

    #[test]
    fn reverse_probe_precedes_forward_apply() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vcs = LedgerVcs::default();
        let (_, log) = log();
        apply_patch_set(
            &vcs,
            &log,
            &descriptors(&["a.patch"]),
            tmp.path(),
            PatchMode::Strict,
            &[],
        )
        .expect("apply");
        assert_eq!(
            *vcs.calls.lock().expect("lock"),
            vec![
                ("a.patch".to_string(), Direction::Reverse),
                ("a.patch".to_string(), Direction::Forward)
            ]
        );
    }

    #[test]
    fn missing_tree_fails_before_engine_calls() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vcs = LedgerVcs::default();
        let (_, log) = log();
        let err = apply_patch_set(
            &vcs,
            &log,
            &descriptors(&["a.patch"]),
            &tmp.path().join("missing"),
            PatchMode::Strict,
            &[],
        )
        .expect_err("missing tree");
        assert!(err.operator_must_fix());
        assert!(vcs.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn enumeration_is_sorted_and_recursive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::create_dir_all(dir.join("ui")).expect("mkdir");
        for f in ["b.patch", "a.patch", "ui/toolbar.patch", "README.md"] {
            fs::write(dir.join(f), "").expect("write");
        }
        let mut targets = BTreeMap::new();
        targets.insert("ui/toolbar.patch".to_string(), "browser".to_string());

        let found = enumerate_patches(dir, &targets).expect("enumerate");
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.patch", "b.patch", "ui/toolbar.patch"]);
        assert_eq!(found[2].order, 2);
        assert_eq!(found[2].target_dir, Some(PathBuf::from("browser")));

        targets.insert("gone.patch".to_string(), "x".to_string());
        assert!(enumerate_patches(dir, &targets).is_err());
    }
}
