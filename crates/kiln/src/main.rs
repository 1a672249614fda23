use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln::config::ConfigDoc;
use kiln::executor::{ExecCtx, builtin_registry, execute_plan};
use kiln::logging::{Log, LogSink, StdoutSink, TracingSink};
use kiln::modules::{core::check_tools, plan_for, source::reset_tree};
use kiln::workspace::WorkspaceConfig;
use kiln::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit structured JSON log records instead of terminal lines
    #[arg(long, global = true)]
    json_logs: bool,
    /// Show debug output, including every engine invocation
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Run every enabled stage in dependency order
    Run {
        build: PathBuf,
        /// Log what would run without touching the tree
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve { build: PathBuf },
    /// Generate the assets of a single brand
    Brand {
        build: PathBuf,
        name: String,
        /// Regenerate rasters even when the logo is unchanged
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the patch set to the engine tree
    Patch {
        build: PathBuf,
        /// Keep going after a patch fails to apply
        #[arg(long)]
        best_effort: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Discard every local change in the engine tree
    Reset {
        build: PathBuf,
        /// Confirm the reset; nothing happens without it
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Probe the configured external tools
    Check { build: PathBuf },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json_logs);

    match &args.cmd {
        Command::Plan { build, dot } => cmd_plan(build, *dot),
        Command::Resolve { build } => cmd_resolve(build),
        Command::Run { build, dry_run } => {
            let doc = kiln::config::load(build)?;
            run_stages(&doc, &args, *dry_run, None)
        }
        Command::Brand {
            build,
            name,
            force,
            dry_run,
        } => {
            let mut doc = kiln::config::load(build)?;
            set_value(&mut doc, "branding", "brand", name.as_str().into())?;
            set_value(&mut doc, "branding", "force", (*force).into())?;
            set_value(&mut doc, "branding", "enabled", true.into())?;
            run_stages(&doc, &args, *dry_run, Some("branding.apply"))
        }
        Command::Patch {
            build,
            best_effort,
            dry_run,
        } => {
            let mut doc = kiln::config::load(build)?;
            if *best_effort {
                set_value(&mut doc, "patches", "mode", "best-effort".into())?;
            }
            set_value(&mut doc, "patches", "enabled", true.into())?;
            run_stages(&doc, &args, *dry_run, Some("patches.apply"))
        }
        Command::Reset {
            build,
            yes,
            dry_run,
        } => cmd_reset(build, &args, *yes, *dry_run),
        Command::Check { build } => cmd_check(build, &args),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn make_log(doc: &ConfigDoc, args: &Args) -> Result<Log> {
    let sink: Arc<dyn LogSink> = if args.json_logs {
        Arc::new(TracingSink)
    } else {
        let ws: WorkspaceConfig = doc.section("workspace")?;
        let paths = kiln::workspace::load_paths(&ws, &doc.base_dir())?;
        Arc::new(StdoutSink::new(paths.error_logs_dir()))
    };
    let log = Log::new(sink);
    if args.debug {
        log.set_debug(true);
    }
    Ok(log)
}

/// Sets `key` inside the top-level `table`, creating the table when absent.
fn set_value(doc: &mut ConfigDoc, table: &str, key: &str, value: toml::Value) -> Result<()> {
    let root = doc
        .value
        .as_table_mut()
        .ok_or_else(|| Error::config("build definition is not a table"))?;
    let entry = root
        .entry(table.to_string())
        .or_insert_with(|| toml::Value::Table(Default::default()));
    let tbl = entry
        .as_table_mut()
        .ok_or_else(|| Error::config(format!("'{table}' must be a table")))?;
    tbl.insert(key.to_string(), value);
    Ok(())
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = kiln::config::load(path)?;
    let plan = plan_for(&doc)?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<9} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = kiln::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::config(format!("cannot render resolved config: {e}")))?;
    print!("{s}");
    Ok(())
}

/// Runs the planned stages; `only` narrows the run to one task plus `core.init`.
fn run_stages(doc: &ConfigDoc, args: &Args, dry_run: bool, only: Option<&str>) -> Result<()> {
    let mut plan = plan_for(doc)?;
    if let Some(id) = only {
        plan.retain(|t| t.id == id || t.id == "core.init");
        plan.validate()?;
    }
    let reg = builtin_registry()?;
    let log = make_log(doc, args)?;
    let mut ctx = ExecCtx::for_doc(doc, dry_run, log.clone())?;
    execute_plan(doc, &plan, &reg, &mut ctx)?;
    log.success(&format!("finished in {}", log.elapsed_hms()));
    Ok(())
}

fn cmd_reset(path: &Path, args: &Args, yes: bool, dry_run: bool) -> Result<()> {
    let doc = kiln::config::load(path)?;
    let log = make_log(&doc, args)?.for_task("reset");
    let ctx = ExecCtx::for_doc(&doc, dry_run, log.clone())?;
    let ws = ctx.workspace_paths_or_init(&doc)?;
    if !yes {
        return Err(Error::precondition(format!(
            "reset discards every change in {}; pass --yes to confirm",
            ws.engine_dir.display()
        )));
    }
    reset_tree(ctx.vcs().as_ref(), &log, &ws.engine_dir)
}

fn cmd_check(path: &Path, args: &Args) -> Result<()> {
    let doc = kiln::config::load(path)?;
    let log = make_log(&doc, args)?.for_task("check");
    let ctx = ExecCtx::for_doc(&doc, false, log.clone())?;
    let missing: Vec<&str> = check_tools(&log, ctx.tools(), &ctx.dispatch_options())
        .into_iter()
        .filter_map(|(name, found)| (!found).then_some(name))
        .collect();
    if missing.is_empty() {
        log.success("all tools found");
        return Ok(());
    }
    Err(Error::precondition(format!(
        "missing tools: {}",
        missing.join(", ")
    )))
}
