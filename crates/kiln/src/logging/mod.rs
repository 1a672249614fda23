use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{Error, Result};

mod sanitize;

pub use sanitize::sanitize_log_line;

const NO_TASK: &str = "<none>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Success,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    Line {
        id: String,
        level: Level,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait LogSink: Send + Sync {
    fn emit(&self, ev: LogEvent);
}

struct LogShared {
    debug: AtomicBool,
    started_at: Instant,
}

/// Process-wide logger handle. Constructed once by the caller and cloned into every
/// component that reports progress; clones share the sink and the debug switch.
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn LogSink>,
    shared: Arc<LogShared>,
    task: Option<String>,
}

impl Log {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            shared: Arc::new(LogShared {
                debug: AtomicBool::new(false),
                started_at: Instant::now(),
            }),
            task: None,
        }
    }

    /// Same logger, lines attributed to `id`.
    pub fn for_task(&self, id: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            shared: Arc::clone(&self.shared),
            task: Some(id.into()),
        }
    }

    pub fn task(&self) -> &str {
        self.task.as_deref().unwrap_or(NO_TASK)
    }

    pub fn set_debug(&self, on: bool) {
        self.shared.debug.store(on, Ordering::Relaxed);
        self.line(
            Level::Debug,
            &format!("debug output {}", if on { "enabled" } else { "disabled" }),
        );
    }

    pub fn is_debug(&self) -> bool {
        self.shared.debug.load(Ordering::Relaxed)
    }

    /// Wall time since the logger was created, as `HH:MM:SS`.
    pub fn elapsed_hms(&self) -> String {
        format_elapsed_hms(self.shared.started_at.elapsed().as_secs())
    }

    pub fn debug(&self, msg: &str) {
        self.line(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.line(Level::Info, msg);
    }

    pub fn warning(&self, msg: &str) {
        self.line(Level::Warn, msg);
    }

    pub fn success(&self, msg: &str) {
        self.line(Level::Success, msg);
    }

    fn line(&self, level: Level, msg: &str) {
        if level == Level::Debug && !self.is_debug() {
            return;
        }
        self.sink.emit(LogEvent::Line {
            id: self.task().to_string(),
            level,
            line: msg.to_string(),
        });
    }

    pub fn emit(&self, ev: LogEvent) {
        self.sink.emit(ev);
    }
}

/// Collects events in memory; used by tests and by callers that post-process output.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                LogEvent::Line { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn lines_at(&self, want: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                LogEvent::Line { line, level, .. } if level == want => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, ev: LogEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

/// Forwards events to `tracing`; the subscriber decides formatting and filtering.
#[derive(Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, ev: LogEvent) {
        match ev {
            LogEvent::TaskSpawned { id } => tracing::debug!(task = %id, "spawned"),
            LogEvent::TaskStarted { id } => tracing::info!(task = %id, "started"),
            LogEvent::Line { id, level, line } => {
                let line = sanitize_log_line(&line);
                match level {
                    Level::Debug => tracing::debug!(task = %id, "{line}"),
                    Level::Info | Level::Success => tracing::info!(task = %id, "{line}"),
                    Level::Warn => tracing::warn!(task = %id, "{line}"),
                }
            }
            LogEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    tracing::info!(task = %id, elapsed_ms = elapsed_ms as u64, "finished");
                } else {
                    tracing::error!(
                        task = %id,
                        elapsed_ms = elapsed_ms as u64,
                        error = %error.unwrap_or_default(),
                        "failed"
                    );
                }
            }
            LogEvent::RunDone { ok, error } => {
                if ok {
                    tracing::info!("run finished");
                } else {
                    tracing::error!(error = %error.unwrap_or_default(), "run failed");
                }
            }
        }
    }
}

/// Plain terminal output. Keeps a bounded tail of each task's lines so a failed task
/// gets its own log file under `<error_logs_root>/<timestamp>/`.
pub struct StdoutSink {
    error_logs_root: PathBuf,
    state: Mutex<StdoutState>,
}

#[derive(Default)]
struct StdoutState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    warnings: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
    error_logged: BTreeSet<String>,
}

impl Default for StdoutSink {
    fn default() -> Self {
        let root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("build")
            .join("error-logs");
        Self::new(root)
    }
}

impl StdoutSink {
    pub fn new(error_logs_root: PathBuf) -> Self {
        Self {
            error_logs_root,
            state: Mutex::new(StdoutState::default()),
        }
    }

    fn stamp(s: &StdoutState) -> String {
        format_elapsed_hms(s.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0))
    }
}

impl LogSink for StdoutSink {
    fn emit(&self, ev: LogEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        if s.started_at.is_none() {
            s.started_at = Some(Instant::now());
        }
        let stamp = Self::stamp(&s);
        match ev {
            LogEvent::TaskSpawned { .. } => {}
            LogEvent::TaskStarted { id } => {
                s.tasks_started += 1;
                println!("{stamp} RUN: {id}");
            }
            LogEvent::Line { id, level, line } => {
                let line = sanitize_log_line(&line);
                remember_line(&mut s.task_logs, &id, &line);
                match level {
                    Level::Debug => println!("{stamp} [{id}] debug: {line}"),
                    Level::Info => println!("{stamp} [{id}] {line}"),
                    Level::Warn => {
                        s.warnings += 1;
                        println!("{stamp} [{id}] WARN: {line}");
                    }
                    Level::Success => println!("{stamp} [{id}] OK: {line}"),
                }
            }
            LogEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    s.tasks_ok += 1;
                    s.task_logs.remove(&id);
                    println!("{stamp} DONE: {id} ({elapsed_ms}ms)");
                } else {
                    s.tasks_failed += 1;
                    s.failed_tasks.push(id.clone());
                    let err = error.unwrap_or_default();
                    println!("{stamp} FAIL: {id} ({elapsed_ms}ms) {err}");
                    let root = self.error_logs_root.as_path();
                    match write_task_error_log(&mut s, root, &id, &err, elapsed_ms) {
                        Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Err(e) => println!("WARN: failed to write error log for {id}: {e}"),
                    }
                }
            }
            LogEvent::RunDone { ok, error } => {
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={} warnings={}",
                    s.tasks_started, s.tasks_ok, s.tasks_failed, s.warnings
                );
                println!("  elapsed: {stamp}");
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutState::default();
            }
        }
    }
}

fn remember_line(task_logs: &mut BTreeMap<String, VecDeque<String>>, id: &str, line: &str) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(line.to_string());
}

fn write_task_error_log(
    s: &mut StdoutState,
    root: &Path,
    id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match s.error_logs_dir.clone() {
        Some(d) => d,
        None => {
            let d = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&d).map_err(|e| {
                Error::io(format!("failed to create error logs dir {}: {e}", d.display()))
            })?;
            s.error_logs_dir = Some(d.clone());
            d
        }
    };
    let path = dir.join(format!("{}.log", filename_component(id)));
    if s.error_logged.contains(id) {
        return Ok(path);
    }

    let mut body = format!("task: {id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in s.task_logs.get(id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }
    fs::write(&path, body)
        .map_err(|e| Error::io(format!("failed to write {}: {e}", path.display())))?;
    s.error_logged.insert(id.to_string());
    s.error_log_paths.push(path.clone());
    Ok(path)
}

fn filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_lines_follow_the_shared_switch() {
        let sink = Arc::new(MemorySink::default());
        let log = Log::new(sink.clone());
        let task_log = log.for_task("patches.apply");

        task_log.debug("hidden");
        log.set_debug(true);
        task_log.debug("shown");

        let debug = sink.lines_at(Level::Debug);
        assert_eq!(debug, vec!["debug output enabled", "shown"]);
        assert!(task_log.is_debug());
    }

    #[test]
    fn lines_carry_the_task_id() {
        let sink = Arc::new(MemorySink::default());
        let log = Log::new(sink.clone()).for_task("branding.apply");
        log.warning("installer background skipped");
        match &sink.events()[0] {
            LogEvent::Line { id, level, line } => {
                assert_eq!(id, "branding.apply");
                assert_eq!(*level, Level::Warn);
                assert_eq!(line, "installer background skipped");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn stdout_sink_writes_error_log_for_failed_task() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = StdoutSink::new(tmp.path().to_path_buf());
        sink.emit(LogEvent::Line {
            id: "patches.apply".into(),
            level: Level::Info,
            line: "error: patch failed: a.c:3".into(),
        });
        sink.emit(LogEvent::TaskFinished {
            id: "patches.apply".into(),
            ok: false,
            error: Some("strict mode".into()),
            elapsed_ms: 5,
        });

        let dirs: Vec<_> = fs::read_dir(tmp.path())
            .expect("read error-logs root")
            .flatten()
            .collect();
        assert_eq!(dirs.len(), 1);
        let body = fs::read_to_string(dirs[0].path().join("patches.apply.log")).expect("log");
        assert!(body.contains("error: strict mode"));
        assert!(body.contains("error: patch failed: a.c:3"));
    }

    #[test]
    fn formats_elapsed_time() {
        assert_eq!(format_elapsed_hms(3723), "01:02:03");
    }
}
