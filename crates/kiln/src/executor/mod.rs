use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{ConfigDoc, ToolsConfig};
use crate::dispatch::DispatchOptions;
use crate::error::{Error, Result};
use crate::logging::{Log, LogEvent};
use crate::planner::Plan;
use crate::raster::{MagickEngine, RasterEngine};
use crate::vcs::{GitEngine, VersionControl};
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// Builds the external engines for a task. Swapped out in tests.
pub trait Engines: Send + Sync {
    fn vcs(&self, log: &Log, opts: DispatchOptions) -> Box<dyn VersionControl>;
    fn raster(&self, log: &Log, opts: DispatchOptions) -> Box<dyn RasterEngine>;
}

/// The configured command-line tools.
pub struct ToolEngines {
    tools: ToolsConfig,
}

impl ToolEngines {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }
}

impl Engines for ToolEngines {
    fn vcs(&self, log: &Log, opts: DispatchOptions) -> Box<dyn VersionControl> {
        Box::new(GitEngine::new(self.tools.git.clone(), log.clone(), opts))
    }

    fn raster(&self, log: &Log, opts: DispatchOptions) -> Box<dyn RasterEngine> {
        Box::new(MagickEngine::new(
            self.tools.magick.clone(),
            self.tools.rsvg.clone(),
            self.tools.iconutil.clone(),
            log.clone(),
            opts,
        ))
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    root_log: Log,
    log: Log,
    tools: ToolsConfig,
    engines: Arc<dyn Engines>,
    /// Directory relative workspace paths are resolved against.
    base_dir: PathBuf,
    workspace_paths: Option<WorkspacePaths>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, log: Log, tools: ToolsConfig) -> Self {
        Self {
            dry_run,
            log: log.clone(),
            root_log: log,
            engines: Arc::new(ToolEngines::new(tools.clone())),
            tools,
            base_dir: PathBuf::from("."),
            workspace_paths: None,
        }
    }

    /// Context for `doc`: tools from `[tools]`, paths relative to the file's directory.
    pub fn for_doc(doc: &ConfigDoc, dry_run: bool, log: Log) -> Result<Self> {
        Ok(Self::new(dry_run, log, doc.tools()?).with_base_dir(doc.base_dir()))
    }

    pub fn with_engines(mut self, engines: Arc<dyn Engines>) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.log = self.root_log.for_task(id);
    }

    pub fn logger(&self) -> &Log {
        &self.log
    }

    pub fn log(&self, msg: &str) {
        self.log.info(msg);
    }

    pub fn tools(&self) -> &ToolsConfig {
        &self.tools
    }

    pub fn set_workspace_paths(&mut self, paths: WorkspacePaths) {
        self.workspace_paths = Some(paths);
    }

    /// Paths set by core.init, or resolved from `[workspace]` without cleaning.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths.as_ref() {
            return Ok(p.clone());
        }
        let mut ws: WorkspaceConfig = doc.section("workspace")?;
        ws.clean = CleanMode::None;
        crate::workspace::init_dirs(&ws, &self.base_dir)
    }

    /// Dispatch options every engine call of this run starts from.
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions::default()
            .shell(self.tools.shell)
            .bash_path(self.tools.bash.clone())
            .dry_run(self.dry_run)
    }

    pub fn vcs(&self) -> Box<dyn VersionControl> {
        self.engines.vcs(&self.log, self.dispatch_options())
    }

    pub fn raster(&self) -> Box<dyn RasterEngine> {
        self.engines.raster(&self.log, self.dispatch_options())
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::config(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.exec.keys().copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Runs the plan one task at a time. The first failing task ends the run; its
/// error keeps its kind, so a fatal dispatch stays fatal for the caller.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::config(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    let events = ctx.root_log.clone();
    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        events.emit(LogEvent::TaskSpawned {
            id: task.id.clone(),
        });
        events.emit(LogEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => events.emit(LogEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                events.emit(LogEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                events.emit(LogEvent::RunDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    events.emit(LogEvent::RunDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", crate::modules::core::core_init)?;
    crate::modules::source::SourceModule::register_tasks(&mut reg)?;
    crate::modules::addons::AddonsModule::register_tasks(&mut reg)?;
    crate::modules::patches::PatchesModule::register_tasks(&mut reg)?;
    crate::modules::branding::BrandingModule::register_tasks(&mut reg)?;
    Ok(reg)
}
