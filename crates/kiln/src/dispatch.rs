//! Runs external tools (git, ImageMagick, unzip, ...) and streams their output.
//!
//! Two failure modes exist on purpose. By default a failing tool only yields
//! `Ok(false)` so callers can probe and recover. With `kill_on_error` set, the first
//! output line matching the error pattern (or a non-zero exit) kills the tool and
//! returns a fatal error that aborts the whole run.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock, mpsc};

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::Log;

static BUILD_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s\d{1,5}:\d\d\.\d\d ").expect("timestamp regex"));

static DEFAULT_ERROR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(error|fatal)\b[:\[]").expect("error regex"));

const MAX_CAPTURED_LINES: usize = 2000;

/// Receives each normalized output line.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShellMode {
    /// Exec the tool directly.
    #[default]
    None,
    /// `sh -c` on unix, `cmd /C` on windows.
    PlatformDefault,
    /// Always a POSIX shell (bash), for hosts whose native shell can't run the command.
    Posix,
}

#[derive(Clone)]
pub struct DispatchOptions {
    pub cwd: Option<PathBuf>,
    pub line_sink: Option<LineSink>,
    pub kill_on_error: bool,
    pub error_pattern: Regex,
    /// Merged over the inherited environment; these values win.
    pub env: BTreeMap<String, String>,
    pub shell: ShellMode,
    pub bash_path: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            line_sink: None,
            kill_on_error: false,
            error_pattern: DEFAULT_ERROR_PATTERN.clone(),
            env: BTreeMap::new(),
            shell: ShellMode::None,
            bash_path: None,
            dry_run: false,
        }
    }
}

impl DispatchOptions {
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn line_sink(mut self, sink: LineSink) -> Self {
        self.line_sink = Some(sink);
        self
    }

    pub fn kill_on_error(mut self, on: bool) -> Self {
        self.kill_on_error = on;
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn shell(mut self, mode: ShellMode) -> Self {
        self.shell = mode;
        self
    }

    pub fn bash_path(mut self, path: Option<PathBuf>) -> Self {
        self.bash_path = path;
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }
}

/// Result of a finished tool invocation.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub success: bool,
    pub status: Option<i32>,
    pub lines: Vec<String>,
    /// Lines seen past the capture limit and not kept.
    pub truncated: usize,
}

impl Captured {
    /// The tool's output, verbatim apart from timestamp normalization.
    pub fn diagnostic(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.truncated > 0 {
            out.push_str(&format!("\n... {} more lines truncated", self.truncated));
        }
        out
    }
}

/// Removes the build-timestamp token (` 12:34.56 `) the engine toolchain interleaves
/// into its output.
pub fn strip_build_timestamp(line: &str) -> String {
    BUILD_TIMESTAMP.replace_all(line, "").into_owned()
}

pub fn dispatch<S: AsRef<str>>(
    log: &Log,
    executable: &str,
    args: &[S],
    opts: &DispatchOptions,
) -> Result<bool> {
    dispatch_capture(log, executable, args, opts).map(|c| c.success)
}

pub fn dispatch_capture<S: AsRef<str>>(
    log: &Log,
    executable: &str,
    args: &[S],
    opts: &DispatchOptions,
) -> Result<Captured> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let display = display_command(executable, &args);
    if opts.dry_run {
        log.info(&format!("DRY-RUN: {display}"));
        return Ok(Captured {
            success: true,
            status: Some(0),
            ..Captured::default()
        });
    }
    log.debug(&format!("exec: {display}"));

    let mut cmd = build_command(executable, &args, opts);
    if let Some(dir) = opts.cwd.as_deref() {
        cmd.current_dir(dir);
    }
    cmd.envs(&opts.env);

    // Own process group, so kill-on-error takes the tool's children down too.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn '{executable}': {e}")))?;
    let pgid = child.id();

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || read_lines(out, tx)));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || read_lines(err, tx)));
    }
    drop(tx);

    let mut captured = Captured::default();
    for raw in rx {
        let line = strip_build_timestamp(&raw);
        if line.trim().is_empty() {
            continue;
        }
        match opts.line_sink.as_ref() {
            Some(sink) => sink(&line),
            None => log.info(&line),
        }
        let tripped = opts.kill_on_error && opts.error_pattern.is_match(&line);
        if captured.lines.len() < MAX_CAPTURED_LINES {
            captured.lines.push(line);
        } else {
            captured.truncated += 1;
        }
        if tripped {
            kill_pgroup(pgid);
            let _ = child.wait();
            for r in readers {
                let _ = r.join();
            }
            return Err(Error::fatal(format!(
                "'{display}' reported an error; aborting\n{}",
                captured.diagnostic()
            )));
        }
    }
    for r in readers {
        let _ = r.join();
    }

    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("failed to wait for '{executable}': {e}")))?;
    captured.success = status.success();
    captured.status = status.code();

    if !captured.success && opts.kill_on_error {
        return Err(Error::fatal(format!(
            "'{display}' failed ({status}); aborting\n{}",
            captured.diagnostic()
        )));
    }
    if !captured.success {
        log.debug(&format!("'{display}' exited with {status}"));
    }
    Ok(captured)
}

fn build_command(executable: &str, args: &[&str], opts: &DispatchOptions) -> Command {
    match opts.shell {
        ShellMode::None => {
            let mut cmd = Command::new(executable);
            cmd.args(args);
            cmd
        }
        ShellMode::PlatformDefault => platform_shell(executable, args),
        ShellMode::Posix => {
            let bash = opts
                .bash_path
                .clone()
                .or_else(|| std::env::var_os("KILN_BASH").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("bash"));
            let mut cmd = Command::new(bash);
            cmd.arg("-c").arg(posix_command_line(executable, args));
            cmd
        }
    }
}

#[cfg(unix)]
fn platform_shell(executable: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(posix_command_line(executable, args));
    cmd
}

#[cfg(not(unix))]
fn platform_shell(executable: &str, args: &[&str]) -> Command {
    let mut line = format!("\"{executable}\"");
    for a in args {
        line.push_str(&format!(" \"{a}\""));
    }
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

fn posix_command_line(executable: &str, args: &[&str]) -> String {
    let mut line = sh_quote(&to_unix_path(Path::new(executable)));
    for a in args {
        line.push(' ');
        line.push_str(&sh_quote(a));
    }
    line
}

fn display_command(executable: &str, args: &[&str]) -> String {
    let mut s = executable.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Renders a path with `/` separators, the form git and the conversion engines accept
/// on every host.
pub fn to_unix_path(p: &Path) -> String {
    p.to_string_lossy().replace('\\', "/")
}

fn read_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut r = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match r.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        // Progress output rewrites the line with '\r'; keep each rewrite.
        for piece in buf.split(|b| *b == b'\n' || *b == b'\r') {
            if piece.is_empty() {
                continue;
            }
            if tx.send(String::from_utf8_lossy(piece).into_owned()).is_err() {
                return;
            }
        }
    }
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative pid targets the process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::sync::Mutex;

    fn have_sh() -> bool {
        cfg!(unix) && Path::new("/bin/sh").exists()
    }

    #[test]
    fn strips_embedded_build_timestamp() {
        assert_eq!(strip_build_timestamp("build 12:34.56 done"), "builddone");
        assert_eq!(
            strip_build_timestamp(" 0:01.50 mach configure"),
            "mach configure"
        );
        assert_eq!(strip_build_timestamp("no stamp here"), "no stamp here");
    }

    #[test]
    fn quotes_posix_arguments() {
        assert_eq!(
            posix_command_line("git", &["apply", "it's.patch"]),
            "'git' 'apply' 'it'\\''s.patch'"
        );
        assert_eq!(to_unix_path(Path::new("a\\b\\c.patch")), "a/b/c.patch");
    }

    #[test]
    fn forwards_normalized_lines_to_sink() {
        if !have_sh() {
            return;
        }
        let got = Arc::new(Mutex::new(Vec::<String>::new()));
        let got2 = Arc::clone(&got);
        let opts = DispatchOptions::default().line_sink(Arc::new(move |l: &str| {
            got2.lock().expect("lock").push(l.to_string());
        }));
        let log = Log::new(Arc::new(MemorySink::default()));
        let ok = dispatch(
            &log,
            "sh",
            &["-c", "echo 'build 12:34.56 done'; echo; echo second"],
            &opts,
        )
        .expect("dispatch");
        assert!(ok);
        assert_eq!(*got.lock().expect("lock"), vec!["builddone", "second"]);
    }

    #[test]
    fn long_output_keeps_a_truncation_marker() {
        if !have_sh() {
            return;
        }
        let log = Log::new(Arc::new(MemorySink::default()));
        let captured = dispatch_capture(
            &log,
            "sh",
            &["-c", "i=0; while [ $i -lt 2003 ]; do echo line$i; i=$((i+1)); done"],
            &DispatchOptions::default(),
        )
        .expect("dispatch");
        assert_eq!(captured.lines.len(), MAX_CAPTURED_LINES);
        assert_eq!(captured.truncated, 3);
        let diag = captured.diagnostic();
        assert!(diag.starts_with("line0\n"));
        assert!(diag.ends_with("line1999\n... 3 more lines truncated"));
    }

    #[test]
    fn soft_mode_reports_false_without_error() {
        if !have_sh() {
            return;
        }
        let sink = Arc::new(MemorySink::default());
        let log = Log::new(sink.clone());
        let captured = dispatch_capture(
            &log,
            "sh",
            &["-c", "echo 'error: nope' >&2; exit 3"],
            &DispatchOptions::default(),
        )
        .expect("soft failure must not raise");
        assert!(!captured.success);
        assert_eq!(captured.status, Some(3));
        assert_eq!(captured.diagnostic(), "error: nope");
        assert_eq!(sink.lines(), vec!["error: nope"]);
    }

    #[test]
    fn kill_on_error_aborts_on_error_line() {
        if !have_sh() {
            return;
        }
        let log = Log::new(Arc::new(MemorySink::default()));
        let opts = DispatchOptions::default().kill_on_error(true);
        let err = dispatch(
            &log,
            "sh",
            &["-c", "echo 'fatal: bad object'; sleep 5; echo unreachable"],
            &opts,
        )
        .expect_err("must abort");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("fatal: bad object"));
        assert!(!err.to_string().contains("unreachable"));
    }

    #[test]
    fn env_overlay_wins_over_inherited_environment() {
        if !have_sh() {
            return;
        }
        let got = Arc::new(Mutex::new(Vec::<String>::new()));
        let got2 = Arc::clone(&got);
        let opts = DispatchOptions::default()
            .env_var("PATH_OVERLAY_PROBE", "overlay")
            .env_var("HOME", "/overlay-home")
            .line_sink(Arc::new(move |l: &str| {
                got2.lock().expect("lock").push(l.to_string());
            }));
        let log = Log::new(Arc::new(MemorySink::default()));
        dispatch(
            &log,
            "sh",
            &["-c", "echo \"$PATH_OVERLAY_PROBE $HOME\""],
            &opts,
        )
        .expect("dispatch");
        assert_eq!(*got.lock().expect("lock"), vec!["overlay /overlay-home"]);
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let sink = Arc::new(MemorySink::default());
        let log = Log::new(sink.clone());
        let opts = DispatchOptions::default().dry_run(true);
        assert!(dispatch(&log, "definitely-not-a-tool", &["x"], &opts).expect("dry run"));
        assert_eq!(sink.lines(), vec!["DRY-RUN: definitely-not-a-tool x"]);
    }
}
