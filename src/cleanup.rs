//! Run guard: guaranteed, exactly-once teardown of the work directory.
//!
//! The binary constructs one [`RunGuard`] at the top of its run function and
//! disposes it at the end. Teardown happens on whichever comes first:
//!
//! - [`RunGuard::dispose`] on the normal path,
//! - `Drop` when an error unwinds out of the run function,
//! - the signal watcher thread on SIGINT/SIGTERM/SIGHUP, which then exits
//!   the process with `128 + signo`.
//!
//! Teardown order: skip everything if the work directory is to be kept;
//! move the run log next to the work directory unless the run succeeded;
//! unmount the tmpfs through its recorded handle; delete the work directory.

use anyhow::{bail, Context, Result};
use nix::sys::signal::{killpg, SigSet, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::process::{ActiveChild, Executor, STOPPING};
use crate::runlog::RunLog;
use crate::workdir::{mount_tmpfs, WorkDir, WorkLayout};

/// Signals that trigger teardown.
pub const HANDLED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// How long a forwarded SIGTERM gets before the child's group is killed.
const CHILD_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct GuardState {
    work_dir: Option<WorkDir>,
    run_log: Option<RunLog>,
    keep_work_dir: bool,
    succeeded: bool,
    disposed: bool,
    /// A `mount` child may be running; it is not yet recorded on the work dir.
    mount_pending: bool,
    /// Runs `umount` with the same tool lookup `mount` had.
    unmount_exec: Option<Executor>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<GuardState>,
    active_child: ActiveChild,
}

/// Owner of the run's work directory and log until teardown.
#[derive(Debug)]
pub struct RunGuard {
    shared: Arc<Shared>,
}

impl Default for RunGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGuard {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GuardState::default()),
                active_child: ActiveChild::default(),
            }),
        }
    }

    /// Route SIGINT/SIGTERM/SIGHUP to a watcher thread that tears down and
    /// exits.
    ///
    /// Blocks those signals on the calling thread, so call it from the main
    /// thread before any other thread is spawned. Children are unaffected:
    /// `std::process::Command` resets the signal mask on exec.
    pub fn watch_signals(&self) -> Result<()> {
        let mut set = SigSet::empty();
        for signal in HANDLED_SIGNALS {
            set.add(signal);
        }
        set.thread_block()
            .context("blocking termination signals on the main thread")?;

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                let Ok(signal) = set.wait() else {
                    return;
                };
                tracing::warn!(signal = signal.as_str(), "received signal, cleaning up");
                if let Err(e) = shared.interrupt() {
                    tracing::error!("cleanup after {} failed: {e:#}", signal.as_str());
                }
                std::process::exit(128 + signal as i32);
            })
            .context("spawning signal watcher thread")?;
        Ok(())
    }

    /// Slot the executor reports running children into.
    pub fn active_child(&self) -> ActiveChild {
        Arc::clone(&self.shared.active_child)
    }

    /// Create the work directory and take ownership of it in one step, so
    /// a signal can never observe a directory the guard does not know about.
    pub fn create_work_dir(
        &self,
        scratch_root: &Path,
        override_path: Option<&Path>,
    ) -> Result<WorkLayout> {
        let mut state = self.shared.lock();
        let work_dir = WorkDir::create(scratch_root, override_path)?;
        let layout = work_dir.layout().clone();
        state.work_dir = Some(work_dir);
        Ok(layout)
    }

    /// Mount tmpfs over the build subtree of the owned work directory.
    ///
    /// The guard lock is not held while `mount` runs, so a signal can stop
    /// it. Until the handle is recorded, teardown unmounts best-effort.
    pub fn mount_scratch(&self, exec: &Executor, use_tmpfs: bool) -> Result<()> {
        if !use_tmpfs {
            return Ok(());
        }
        let target = {
            let mut state = self.shared.lock();
            let Some(work_dir) = state.work_dir.as_ref() else {
                bail!("no work directory to mount scratch space on");
            };
            if work_dir.mount().is_some() {
                return Ok(());
            }
            let target = work_dir.layout().build_dir();
            state.mount_pending = true;
            state.unmount_exec = Some(exec.clone().with_active_child(ActiveChild::default()));
            target
        };

        let mounted = mount_tmpfs(exec, &target);

        let mut state = self.shared.lock();
        state.mount_pending = false;
        let handle = mounted?;
        match state.work_dir.as_mut() {
            Some(work_dir) => {
                work_dir.record_mount(handle);
                Ok(())
            }
            None => bail!("work directory was released while mounting scratch space"),
        }
    }

    pub fn attach_log(&self, log: RunLog) {
        self.shared.lock().run_log = Some(log);
    }

    pub fn set_keep_work_dir(&self, keep: bool) {
        self.shared.lock().keep_work_dir = keep;
    }

    /// The run reached its end; the log has been promoted and need not be
    /// preserved next to the work directory.
    pub fn mark_succeeded(&self) {
        self.shared.lock().succeeded = true;
    }

    /// Tear down now and report the outcome.
    pub fn dispose(self) -> Result<()> {
        self.shared.teardown()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(e) = self.shared.teardown() {
            tracing::error!("cleanup failed: {e:#}");
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn teardown(&self) -> Result<()> {
        let mut state = self.lock();
        self.teardown_locked(&mut state)
    }

    /// Stop the running child first: a thread holding the state lock may be
    /// waiting on it.
    fn interrupt(&self) -> Result<()> {
        self.stop_active_child();
        let mut state = self.lock();
        self.teardown_locked(&mut state)
    }

    fn teardown_locked(&self, state: &mut GuardState) -> Result<()> {
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;

        let Some(mut work_dir) = state.work_dir.take() else {
            return Ok(());
        };
        let layout = work_dir.layout().clone();
        if state.keep_work_dir {
            tracing::info!(work_dir = %layout.root().display(), "keeping work directory");
            return Ok(());
        }

        if !state.succeeded {
            if let Some(log) = &state.run_log {
                let dest = layout.preserved_log_path();
                match log.preserve(&dest) {
                    Ok(()) => tracing::info!(log = %dest.display(), "run log preserved"),
                    Err(e) => tracing::warn!("could not preserve run log: {e:#}"),
                }
            }
        }

        // Own slot: the run's slot may already refuse new commands.
        let exec = state
            .unmount_exec
            .take()
            .unwrap_or_else(|| Executor::new(layout.tmp_dir()));
        if state.mount_pending {
            // Interrupted mid-mount: there may or may not be a mount.
            let target = layout.build_dir();
            let released = exec.cmd("umount").arg(&target).allow_fail().run();
            if let Ok(result) = released {
                if result.success() {
                    tracing::info!(mount_point = %target.display(), "unmounted tmpfs");
                }
            }
        }
        work_dir.unmount(&exec)?;
        work_dir.remove()
    }

    /// Refuse further commands, SIGTERM the running child's process group,
    /// and SIGKILL it if it outlives the grace period.
    fn stop_active_child(&self) {
        let pgid = self.active_child.swap(STOPPING, Ordering::SeqCst);
        if pgid <= 0 {
            return;
        }
        let group = Pid::from_raw(pgid);
        let _ = killpg(group, Signal::SIGTERM);
        if wait_for_group_exit(group, CHILD_GRACE) {
            return;
        }
        tracing::warn!(pgid, "child ignored SIGTERM, killing");
        let _ = killpg(group, Signal::SIGKILL);
        if !wait_for_group_exit(group, CHILD_GRACE) {
            tracing::warn!(pgid, "child group still present after SIGKILL");
        }
    }
}

/// Poll until no process is left in `group` (the main thread reaps the
/// leader).
fn wait_for_group_exit(group: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if killpg(group, None).is_err() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}
