use std::fs;
use std::path::Path;

use serde::Deserialize;

use kiln_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::dispatch::ShellMode;
use crate::executor::ExecCtx;
use crate::logging::Log;
use crate::vcs::VersionControl;
use crate::{Error, Result};

/// Set to leave an unpacked engine tree alone (CI images ship it pre-initialized).
pub const SKIP_INIT_ENV: &str = "KILN_SKIP_INIT";

const VERSION_FILE: [&str; 3] = ["browser", "config", "version_display.txt"];

fn default_true() -> bool {
    true
}

fn default_commit_message() -> String {
    "Engine initialized by kiln".into()
}

#[Task(
    id = "source.init",
    module = "source",
    phase = "init",
    provides = ["tree:ready"],
    after = ["core.init"],
    default_label = "Initialize engine repository",
    config_path = "source"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Name of the pristine import branch; read from the tree when unset.
    pub version: Option<String>,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            version: None,
            commit_message: default_commit_message(),
        }
    }
}

/// Everything `init_repository` needs besides the engine.
#[derive(Debug, Clone)]
pub struct InitPlan {
    pub version: String,
    pub work_branch: String,
    pub eol: &'static str,
    pub commit_message: String,
}

/// Checks the tree is an unpacked engine and reads its display version.
pub fn engine_version(tree: &Path) -> Result<String> {
    if !tree.is_dir() {
        return Err(Error::precondition(format!(
            "engine tree {} does not exist; unpack the engine source first",
            tree.display()
        )));
    }
    let file = VERSION_FILE.iter().fold(tree.to_path_buf(), |p, s| p.join(s));
    let raw = fs::read_to_string(&file).map_err(|e| {
        Error::precondition(format!(
            "{} is not an engine tree ({}: {e})",
            tree.display(),
            file.display()
        ))
    })?;
    let version = raw.trim();
    if version.is_empty() {
        return Err(Error::precondition(format!("{} is empty", file.display())));
    }
    Ok(version.to_string())
}

/// Line endings recorded in the repository config: `lf` only when the Posix shell is forced.
pub fn eol_for(shell: ShellMode) -> &'static str {
    match shell {
        ShellMode::Posix => "lf",
        ShellMode::None | ShellMode::PlatformDefault => "crlf",
    }
}

/// Imports the tree as an orphan branch named after the engine version, then opens
/// the project work branch on top of it.
pub fn init_repository(
    vcs: &dyn VersionControl,
    log: &Log,
    tree: &Path,
    plan: &InitPlan,
) -> Result<()> {
    log.info(&format!("initializing repository in {}", tree.display()));
    vcs.init(tree)?;
    vcs.checkout_orphan(tree, &plan.version)?;
    vcs.configure(tree, "core.autocrlf", "false")?;
    vcs.configure(tree, "core.eol", plan.eol)?;
    log.info("adding engine files (this can take a while)");
    vcs.add_all(tree)?;
    vcs.commit(tree, &plan.commit_message)?;
    vcs.create_branch(tree, &plan.work_branch)?;
    log.success(&format!(
        "engine {} imported; working on '{}'",
        plan.version, plan.work_branch
    ));
    Ok(())
}

/// Throws away every local change: tracked edits, then untracked and ignored files.
pub fn reset_tree(vcs: &dyn VersionControl, log: &Log, tree: &Path) -> Result<()> {
    if !tree.join(".git").exists() {
        return Err(Error::precondition(format!(
            "{} is not a repository; nothing to reset",
            tree.display()
        )));
    }
    vcs.reset(tree)?;
    vcs.clean(tree)?;
    log.success(&format!("{} reset", tree.display()));
    Ok(())
}

impl SourceConfig {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let tree = ws.engine_dir.as_path();
        let detected = engine_version(tree)?;

        if std::env::var_os(SKIP_INIT_ENV).is_some() {
            ctx.log(&format!("{SKIP_INIT_ENV} set; leaving {} as is", tree.display()));
            return Ok(());
        }
        if tree.join(".git").exists() {
            ctx.log(&format!("{} is already a repository", tree.display()));
            return Ok(());
        }

        let project = doc.project()?;
        let plan = InitPlan {
            version: cfg
                .version
                .clone()
                .or(project.version.clone())
                .unwrap_or(detected),
            work_branch: project.branch_name(),
            eol: eol_for(ctx.tools().shell),
            commit_message: cfg.commit_message.clone(),
        };
        let vcs = ctx.vcs();
        init_repository(vcs.as_ref(), ctx.logger(), tree, &plan)
    }
}

#[Module(
    id = "source",
    config = SourceConfig,
    config_path = "source",
    tasks = [SourceConfig]
)]
pub struct SourceModule;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::dispatch::Captured;
    use crate::logging::MemorySink;
    use crate::vcs::Direction;

    #[derive(Default)]
    struct RecordingVcs {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingVcs {
        fn push(&self, s: String) -> Result<()> {
            self.calls.lock().expect("lock").push(s);
            Ok(())
        }
    }

    impl VersionControl for RecordingVcs {
        fn init(&self, _: &Path) -> Result<()> {
            self.push("init".into())
        }
        fn checkout_orphan(&self, _: &Path, b: &str) -> Result<()> {
            self.push(format!("orphan {b}"))
        }
        fn configure(&self, _: &Path, k: &str, v: &str) -> Result<()> {
            self.push(format!("config {k}={v}"))
        }
        fn add_all(&self, _: &Path) -> Result<()> {
            self.push("add".into())
        }
        fn commit(&self, _: &Path, m: &str) -> Result<()> {
            self.push(format!("commit {m}"))
        }
        fn create_branch(&self, _: &Path, n: &str) -> Result<()> {
            self.push(format!("branch {n}"))
        }
        fn commit_path(&self, _: &Path, _: &Path, m: &str) -> Result<bool> {
            self.push(format!("commit {m}"))?;
            Ok(true)
        }
        fn apply_patch(&self, _: &Path, _: &Path, _: Direction, _: &[String]) -> Result<Captured> {
            Ok(Captured::default())
        }
        fn reset(&self, _: &Path) -> Result<()> {
            self.push("reset".into())
        }
        fn clean(&self, _: &Path) -> Result<()> {
            self.push("clean".into())
        }
    }

    fn engine_tree(version: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tree = tmp.path().join("engine");
        let cfg_dir = tree.join("browser").join("config");
        fs::create_dir_all(&cfg_dir).expect("mkdir");
        fs::write(cfg_dir.join("version_display.txt"), version).expect("write");
        (tmp, tree)
    }

    #[test]
    fn reads_engine_version() {
        let (_tmp, tree) = engine_tree("128.0.3\n");
        assert_eq!(engine_version(&tree).expect("version"), "128.0.3");
        let err = engine_version(&tree.join("missing")).expect_err("missing");
        assert!(err.operator_must_fix());
    }

    #[test]
    fn eol_follows_forced_posix_shell() {
        assert_eq!(eol_for(ShellMode::Posix), "lf");
        assert_eq!(eol_for(ShellMode::PlatformDefault), "crlf");
        assert_eq!(eol_for(ShellMode::None), "crlf");
    }

    #[test]
    fn init_runs_engine_steps_in_order() {
        let (_tmp, tree) = engine_tree("128.0.3");
        let vcs = RecordingVcs::default();
        let log = Log::new(Arc::new(MemorySink::default()));
        let plan = InitPlan {
            version: "128.0.3".into(),
            work_branch: "pulse_browser".into(),
            eol: "lf",
            commit_message: default_commit_message(),
        };
        init_repository(&vcs, &log, &tree, &plan).expect("init");
        assert_eq!(
            *vcs.calls.lock().expect("lock"),
            vec![
                "init",
                "orphan 128.0.3",
                "config core.autocrlf=false",
                "config core.eol=lf",
                "add",
                "commit Engine initialized by kiln",
                "branch pulse_browser",
            ]
        );
    }

    #[test]
    fn reset_requires_repository() {
        let (_tmp, tree) = engine_tree("1");
        let vcs = RecordingVcs::default();
        let log = Log::new(Arc::new(MemorySink::default()));
        assert!(reset_tree(&vcs, &log, &tree).is_err());

        fs::create_dir_all(tree.join(".git")).expect("mkdir");
        reset_tree(&vcs, &log, &tree).expect("reset");
        assert_eq!(*vcs.calls.lock().expect("lock"), vec!["reset", "clean"]);
    }
}
