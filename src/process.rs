//! Command execution with uniform fail-fast semantics.
//!
//! Every external tool the build touches goes through [`Cmd`]. Each
//! invocation gets a fresh capture file inside the executor's scratch
//! directory; stdout and stderr are merged into it.
//!
//! - exit 0: the capture file is deleted.
//! - non-zero: the command line, exit code and indented output are logged,
//!   the capture file is kept, and a [`CommandFailed`] error is returned.
//!
//! ```rust,ignore
//! let exec = Executor::new(work_dir.tmp_dir());
//! exec.cmd("make")
//!     .arg("-C")
//!     .arg(&source)
//!     .arg("olddefconfig")
//!     .error_msg("kernel config reconciliation failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CommandFailed;

/// Process group id of the command currently running, 0 when idle,
/// [`STOPPING`] once the run is being torn down.
///
/// Shared with the signal watcher so it can forward termination.
pub type ActiveChild = Arc<AtomicI32>;

/// [`ActiveChild`] value that refuses every further command.
pub const STOPPING: i32 = -1;

/// Runs external commands with their scratch files in one directory.
#[derive(Debug, Clone)]
pub struct Executor {
    scratch: PathBuf,
    path_prefix: Vec<PathBuf>,
    active_child: ActiveChild,
}

impl Executor {
    pub fn new(scratch: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
            path_prefix: Vec::new(),
            active_child: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Report running children into `slot`.
    pub fn with_active_child(mut self, slot: ActiveChild) -> Self {
        self.active_child = slot;
        self
    }

    /// Search `dir` before the inherited `PATH` for every command.
    pub fn with_path_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prefix.push(dir.into());
        self
    }

    /// Directory that receives capture files; exported as `TMPDIR` to children.
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn active_child(&self) -> &ActiveChild {
        &self.active_child
    }

    /// `PATH` value handed to children, given extra leading directories.
    pub fn search_path(&self, extra: &[PathBuf]) -> Result<OsString> {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = extra
            .iter()
            .chain(self.path_prefix.iter())
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).context("building PATH for child process")
    }

    pub fn cmd(&self, program: impl AsRef<OsStr>) -> Cmd<'_> {
        Cmd {
            exec: self,
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            path_prefix: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }
}

/// Builder for one external command.
#[derive(Debug)]
pub struct Cmd<'a> {
    exec: &'a Executor,
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    path_prefix: Vec<PathBuf>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

/// Outcome of a command that was allowed to fail, or whose output was kept.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub output: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl<'a> Cmd<'a> {
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Search `dir` first for this command only.
    pub fn path_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prefix.push(dir.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Context attached to the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return a non-zero exit as `Ok` instead of failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run to completion. Output is discarded on success.
    pub fn run(self) -> Result<CmdResult> {
        self.execute(false)
    }

    /// Run to completion and return the captured output.
    pub fn output(self) -> Result<String> {
        Ok(self.execute(true)?.output)
    }

    /// The command line as a shell user would read it.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn execute(self, keep_output: bool) -> Result<CmdResult> {
        let line = self.display();
        tracing::debug!(command = %line, "running");

        let capture = tempfile::Builder::new()
            .prefix("cmd-")
            .suffix(".out")
            .tempfile_in(&self.exec.scratch)
            .with_context(|| {
                format!(
                    "creating capture file for '{}' in '{}'",
                    line,
                    self.exec.scratch.display()
                )
            })?;
        let stdout = capture
            .as_file()
            .try_clone()
            .context("duplicating capture file handle")?;
        let stderr = capture
            .as_file()
            .try_clone()
            .context("duplicating capture file handle")?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("PATH", self.exec.search_path(&self.path_prefix)?)
            .env("TMPDIR", &self.exec.scratch)
            .process_group(0);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let slot = &self.exec.active_child;
        if slot.load(Ordering::SeqCst) == STOPPING {
            bail!("not starting '{line}': run is shutting down");
        }
        let mut child = spawn(&mut command).with_context(|| format!("spawning '{line}'"))?;
        let pgid = i32::try_from(child.id()).unwrap_or(0);
        if slot
            .compare_exchange(0, pgid, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
            let _ = child.wait();
            bail!("not starting '{line}': run is shutting down");
        }
        let waited = child.wait();
        let _ = slot.compare_exchange(pgid, 0, Ordering::SeqCst, Ordering::SeqCst);
        let status = waited.with_context(|| format!("waiting for '{line}'"))?;

        let output = String::from_utf8_lossy(
            &fs::read(capture.path())
                .with_context(|| format!("reading captured output of '{line}'"))?,
        )
        .into_owned();

        if status.success() {
            return Ok(CmdResult {
                status,
                output: if keep_output { output } else { String::new() },
            });
        }

        if self.allow_fail {
            tracing::debug!(command = %line, %status, "command failed (allowed)");
            return Ok(CmdResult { status, output });
        }

        let kept = capture
            .keep()
            .map(|(_, path)| path)
            .map_err(|e| e.error)
            .with_context(|| format!("keeping captured output of '{line}'"))?;

        let failed = CommandFailed {
            command: line,
            code: status.code(),
            output,
        };
        tracing::error!(
            capture = %kept.display(),
            "{}",
            failed.diagnostic().trim_end()
        );

        let err = anyhow::Error::new(failed);
        Err(match self.error_msg {
            Some(msg) => err.context(msg),
            None => err,
        })
    }
}

/// Spawn, retrying briefly on ETXTBSY: a script written moments ago can
/// still be held open for writing by a concurrent fork.
fn spawn(command: &mut Command) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(nix::libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(20 * attempts));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Executor) {
        let temp = TempDir::new().unwrap();
        let exec = Executor::new(temp.path());
        (temp, exec)
    }

    fn entries(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn success_discards_capture_file() {
        let (temp, exec) = scratch();
        let result = exec.cmd("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(result.success());
        assert!(result.output.is_empty());
        assert!(entries(temp.path()).is_empty());
    }

    #[test]
    fn failure_is_fatal_and_keeps_merged_output() {
        let (temp, exec) = scratch();
        let err = exec
            .cmd("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .error_msg("demo step failed")
            .run()
            .unwrap_err();

        assert_eq!(err.to_string(), "demo step failed");
        let failed = err.downcast_ref::<CommandFailed>().unwrap();
        assert_eq!(failed.code, Some(3));
        assert!(failed.output.contains("out"));
        assert!(failed.output.contains("err"));
        assert!(failed.command.starts_with("sh -c"));

        let kept = entries(temp.path());
        assert_eq!(kept.len(), 1, "failing capture file should be kept");
    }

    #[test]
    fn allow_fail_returns_status() {
        let (_temp, exec) = scratch();
        let result = exec
            .cmd("sh")
            .args(["-c", "echo nope; exit 1"])
            .allow_fail()
            .run()
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.output.trim(), "nope");
    }

    #[test]
    fn output_returns_captured_text() {
        let (_temp, exec) = scratch();
        let out = exec.cmd("sh").args(["-c", "printf 'a\\nb\\n'"]).output().unwrap();
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn children_see_scratch_as_tmpdir() {
        let (temp, exec) = scratch();
        let out = exec.cmd("sh").args(["-c", "echo $TMPDIR"]).output().unwrap();
        assert_eq!(out.trim(), temp.path().to_string_lossy());
    }

    #[test]
    fn path_prefix_takes_precedence() {
        let (temp, exec) = scratch();
        let bin = temp.path().join("bin");
        fs::create_dir(&bin).unwrap();
        let tool = bin.join("kb-fake-tool");
        fs::write(&tool, "#!/bin/sh\necho from-prefix\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let exec = exec.with_path_prefix(&bin);
        let out = exec.cmd("kb-fake-tool").output().unwrap();
        assert_eq!(out.trim(), "from-prefix");
    }

    #[test]
    fn missing_program_is_an_error() {
        let (_temp, exec) = scratch();
        let err = exec.cmd("kb-definitely-not-installed").run().unwrap_err();
        assert!(err.to_string().contains("spawning"));
    }

    #[test]
    fn nothing_starts_once_stopping() {
        let (temp, exec) = scratch();
        let marker = temp.path().join("ran");
        exec.active_child().store(STOPPING, Ordering::SeqCst);
        let err = exec
            .cmd("touch")
            .arg(&marker)
            .allow_fail()
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("shutting down"));
        assert!(!marker.exists());
        assert_eq!(exec.active_child().load(Ordering::SeqCst), STOPPING);
    }

    #[test]
    fn active_child_is_cleared_after_run() {
        let (_temp, exec) = scratch();
        exec.cmd("true").run().unwrap();
        assert_eq!(exec.active_child().load(Ordering::SeqCst), 0);
    }
}
