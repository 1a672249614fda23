use crate::config::{ConfigDoc, ToolsConfig};
use crate::dispatch::{DispatchOptions, dispatch_capture};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::logging::Log;
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::{CleanMode, WorkspaceConfig};

/// Top-level tables a build definition may carry.
const KNOWN_TABLES: [&str; 8] = [
    "project",
    "workspace",
    "tools",
    "source",
    "addons",
    "patches",
    "branding",
    "brands",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if let Some(root) = doc.value.as_table() {
            for key in root.keys() {
                if !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(Error::config(format!(
                        "unknown config key '{key}'; expected one of: {}",
                        KNOWN_TABLES.join(", ")
                    )));
                }
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Prepare workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

pub fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.section("workspace")?;
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.engine_dir = {}", ws.engine_dir));
    ctx.log(&format!(
        "workspace.clean = {}",
        match ws.clean {
            CleanMode::None => "none",
            CleanMode::Build => "build",
        }
    ));
    if ctx.dry_run {
        ctx.log("DRY-RUN: leaving workspace dirs untouched");
        return Ok(());
    }

    let paths = crate::workspace::init_dirs(&ws, ctx.base_dir())?;
    ctx.log(&format!("build dir ready at {}", paths.build_dir.display()));
    ctx.set_workspace_paths(paths);
    Ok(())
}

/// Probes every configured tool with `--version`. A tool that cannot be spawned
/// or exits non-zero is reported missing; nothing here fails the caller.
pub fn check_tools(
    log: &Log,
    tools: &ToolsConfig,
    opts: &DispatchOptions,
) -> Vec<(&'static str, bool)> {
    let opts = opts.clone().dry_run(false);
    tools
        .all()
        .into_iter()
        .map(|(name, exe)| {
            let found = match dispatch_capture(log, exe, &["--version"], &opts) {
                Ok(out) => out.success,
                Err(e) => {
                    log.debug(&format!("{name}: {e}"));
                    false
                }
            };
            if found {
                log.success(&format!("{name}: {exe}"));
            } else {
                log.warning(&format!("{name}: '{exe}' not found"));
            }
            (name, found)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::logging::{Level, MemorySink};

    #[test]
    fn rejects_unknown_tables() {
        let doc = ConfigDoc::parse("<mem>", "[stage]\nfiles = []\n").expect("doc");
        let mut plan = Plan::default();
        let err = CoreModule.plan(&doc, &mut plan).expect_err("unknown");
        assert!(err.operator_must_fix());
        assert!(err.to_string().contains("'stage'"));
    }

    #[test]
    fn missing_tool_is_reported_not_fatal() {
        let sink = Arc::new(MemorySink::default());
        let log = Log::new(sink.clone());
        let tools = ToolsConfig {
            git: "kiln-definitely-missing-tool".into(),
            ..ToolsConfig::default()
        };
        let report = check_tools(&log, &tools, &DispatchOptions::default());
        assert_eq!(report[0], ("git", false));
        assert!(
            sink.lines_at(Level::Warn)
                .iter()
                .any(|l| l.contains("kiln-definitely-missing-tool"))
        );
    }
}
