//! Per-run ephemeral work directory.
//!
//! Layout:
//!
//! ```text
//! <scratch_root>/kernel-builder.XXXXXX/   mode 0770
//! ├── tmp/            capture files, TMPDIR for children, download staging
//! ├── build/          optional tmpfs mount point; package output lands here
//! │   └── linux/      extracted source tree
//! └── build.log       aggregate run log
//! ```
//!
//! The directory is removed by [`WorkDir::teardown`], normally through the
//! run guard in [`crate::cleanup`].

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::PreconditionError;
use crate::process::Executor;

/// Name prefix of generated work directories.
pub const WORK_DIR_PREFIX: &str = "kernel-builder.";

/// Owner and group only.
const WORK_DIR_MODE: u32 = 0o770;

/// Paths inside one work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Build output root: package files are written here by the toolchain.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.build_dir().join("linux")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("build.log")
    }

    /// `<workdir>.log`, next to the work directory.
    pub fn preserved_log_path(&self) -> PathBuf {
        let mut name = OsString::from(self.root.as_os_str());
        name.push(".log");
        PathBuf::from(name)
    }
}

/// Proof of a tmpfs mount made by this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    target: PathBuf,
}

impl MountHandle {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// An exclusively owned work directory.
#[derive(Debug)]
pub struct WorkDir {
    layout: WorkLayout,
    mount: Option<MountHandle>,
}

impl WorkDir {
    /// Create a uniquely named work directory under `scratch_root`, or at
    /// `override_path` when given. An override that already exists is refused.
    pub fn create(scratch_root: &Path, override_path: Option<&Path>) -> Result<Self> {
        let root = match override_path {
            Some(path) => {
                if fs::symlink_metadata(path).is_ok() {
                    return Err(PreconditionError::new(format!(
                        "work directory '{}' already exists; refusing to reuse or delete it",
                        path.display()
                    ))
                    .into());
                }
                fs::create_dir(path).with_context(|| {
                    format!("creating work directory '{}'", path.display())
                })?;
                path.to_path_buf()
            }
            None => {
                fs::create_dir_all(scratch_root).with_context(|| {
                    format!("creating scratch root '{}'", scratch_root.display())
                })?;
                tempfile::Builder::new()
                    .prefix(WORK_DIR_PREFIX)
                    .tempdir_in(scratch_root)
                    .with_context(|| {
                        format!(
                            "allocating a unique work directory under '{}'",
                            scratch_root.display()
                        )
                    })?
                    .keep()
            }
        };

        let layout = WorkLayout::new(root);
        restrict(layout.root())?;
        for dir in [layout.tmp_dir(), layout.build_dir()] {
            fs::create_dir(&dir)
                .with_context(|| format!("creating '{}'", dir.display()))?;
            restrict(&dir)?;
        }

        Ok(Self {
            layout,
            mount: None,
        })
    }

    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    pub fn mount(&self) -> Option<&MountHandle> {
        self.mount.as_ref()
    }

    /// Back the build subtree with tmpfs when requested; otherwise it stays on
    /// the scratch root's filesystem.
    pub fn mount_scratch(&mut self, exec: &Executor, use_tmpfs: bool) -> Result<()> {
        if !use_tmpfs || self.mount.is_some() {
            return Ok(());
        }
        let handle = mount_tmpfs(exec, &self.layout.build_dir())?;
        self.record_mount(handle);
        Ok(())
    }

    /// Take responsibility for a mount made with [`mount_tmpfs`].
    pub fn record_mount(&mut self, handle: MountHandle) {
        self.mount = Some(handle);
    }

    /// Unmount if mounted, then delete the whole directory.
    pub fn teardown(mut self, exec: &Executor) -> Result<()> {
        self.unmount(exec)?;
        self.remove()
    }

    /// Undo [`WorkDir::mount_scratch`] using the recorded handle.
    pub fn unmount(&mut self, exec: &Executor) -> Result<()> {
        let Some(mount) = self.mount.take() else {
            return Ok(());
        };
        let result = exec
            .cmd("umount")
            .arg(mount.target())
            .error_msg(format!("unmounting tmpfs at '{}'", mount.target().display()))
            .run();
        if let Err(e) = result {
            self.mount = Some(mount);
            return Err(e);
        }
        tracing::info!(mount_point = %mount.target().display(), "unmounted tmpfs");
        Ok(())
    }

    /// Delete the directory tree. Refused while a mount is still recorded,
    /// so deletion never reaches through a live mount point.
    pub fn remove(self) -> Result<()> {
        if let Some(mount) = &self.mount {
            bail!(
                "refusing to remove work directory '{}': '{}' is still mounted",
                self.layout.root().display(),
                mount.target().display()
            );
        }
        fs::remove_dir_all(self.layout.root()).with_context(|| {
            format!(
                "removing work directory '{}'",
                self.layout.root().display()
            )
        })?;
        tracing::info!(work_dir = %self.layout.root().display(), "removed work directory");
        Ok(())
    }
}

/// Mount a tmpfs sized to all available memory at `target`.
pub fn mount_tmpfs(exec: &Executor, target: &Path) -> Result<MountHandle> {
    exec.cmd("mount")
        .args(["-t", "tmpfs", "-o", "size=100%,mode=0770", "tmpfs"])
        .arg(target)
        .error_msg(format!("mounting tmpfs at '{}'", target.display()))
        .run()?;
    tracing::info!(mount_point = %target.display(), "mounted tmpfs");
    Ok(MountHandle {
        target: target.to_path_buf(),
    })
}

fn restrict(dir: &Path) -> Result<()> {
    fs::set_permissions(dir, fs::Permissions::from_mode(WORK_DIR_MODE))
        .with_context(|| format!("restricting permissions on '{}'", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_script;
    use tempfile::TempDir;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    /// Fake `mount`/`umount` that append their arguments to `calls`.
    /// `umount` exits with `umount_status`.
    fn fake_mount_tools(scratch: &TempDir, umount_status: i32) -> (PathBuf, PathBuf) {
        let bin = scratch.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let calls = scratch.path().join("mount-calls");
        write_script(
            &bin.join("mount"),
            &format!("echo \"mount $*\" >> \"{}\"\n", calls.display()),
        );
        write_script(
            &bin.join("umount"),
            &format!(
                "echo \"umount $*\" >> \"{}\"\nexit {umount_status}\n",
                calls.display()
            ),
        );
        (bin, calls)
    }

    fn read_calls(calls: &Path) -> Vec<String> {
        fs::read_to_string(calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn create_allocates_unique_restricted_directories() {
        let scratch = TempDir::new().unwrap();
        let a = WorkDir::create(scratch.path(), None).unwrap();
        let b = WorkDir::create(scratch.path(), None).unwrap();

        assert_ne!(a.layout().root(), b.layout().root());
        let name = a.layout().root().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(WORK_DIR_PREFIX));
        assert_eq!(mode(a.layout().root()), 0o770);
        assert!(a.layout().tmp_dir().is_dir());
        assert!(a.layout().build_dir().is_dir());
        assert!(!a.layout().source_dir().exists());
    }

    #[test]
    fn override_path_is_used_when_absent() {
        let scratch = TempDir::new().unwrap();
        let target = scratch.path().join("explicit");
        let work = WorkDir::create(Path::new("/nonexistent-scratch"), Some(&target)).unwrap();
        assert_eq!(work.layout().root(), target);
        assert!(target.join("tmp").is_dir());
    }

    #[test]
    fn existing_override_path_is_refused_untouched() {
        let scratch = TempDir::new().unwrap();
        let target = scratch.path().join("precious");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("data"), b"keep me").unwrap();

        let err = WorkDir::create(scratch.path(), Some(&target)).unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
        assert_eq!(fs::read(target.join("data")).unwrap(), b"keep me");
    }

    #[test]
    fn teardown_removes_everything() {
        let scratch = TempDir::new().unwrap();
        let work = WorkDir::create(scratch.path(), None).unwrap();
        let root = work.layout().root().to_path_buf();
        fs::create_dir_all(work.layout().source_dir()).unwrap();
        fs::write(work.layout().source_dir().join("Makefile"), b"all:\n").unwrap();

        let exec = Executor::new(work.layout().tmp_dir());
        work.teardown(&exec).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn without_tmpfs_nothing_is_mounted() {
        let scratch = TempDir::new().unwrap();
        let mut work = WorkDir::create(scratch.path(), None).unwrap();
        let exec = Executor::new(work.layout().tmp_dir());
        work.mount_scratch(&exec, false).unwrap();
        assert!(work.mount().is_none());
    }

    #[test]
    fn tmpfs_mount_is_recorded_and_undone_before_removal() {
        let scratch = TempDir::new().unwrap();
        let (bin, calls) = fake_mount_tools(&scratch, 0);
        let mut work = WorkDir::create(&scratch.path().join("work"), None).unwrap();
        let root = work.layout().root().to_path_buf();
        let exec = Executor::new(work.layout().tmp_dir()).with_path_prefix(bin);

        work.mount_scratch(&exec, true).unwrap();
        let build = work.layout().build_dir();
        assert_eq!(work.mount().map(MountHandle::target), Some(build.as_path()));

        work.teardown(&exec).unwrap();
        assert!(!root.exists());
        assert_eq!(
            read_calls(&calls),
            [
                format!("mount -t tmpfs -o size=100%,mode=0770 tmpfs {}", build.display()),
                format!("umount {}", build.display()),
            ]
        );
    }

    #[test]
    fn failed_unmount_keeps_the_directory() {
        let scratch = TempDir::new().unwrap();
        let (bin, calls) = fake_mount_tools(&scratch, 32);
        let mut work = WorkDir::create(&scratch.path().join("work"), None).unwrap();
        let root = work.layout().root().to_path_buf();
        let exec = Executor::new(work.layout().tmp_dir()).with_path_prefix(bin);
        work.mount_scratch(&exec, true).unwrap();

        let err = work.teardown(&exec).unwrap_err();
        assert!(err.to_string().contains("unmounting tmpfs"), "{err:#}");
        assert!(root.join("build").is_dir());
        assert_eq!(read_calls(&calls).len(), 2);
    }

    #[test]
    fn removal_is_refused_while_a_mount_is_recorded() {
        let scratch = TempDir::new().unwrap();
        let mut work = WorkDir::create(scratch.path(), None).unwrap();
        let root = work.layout().root().to_path_buf();
        work.record_mount(MountHandle {
            target: work.layout().build_dir(),
        });

        let err = work.remove().unwrap_err();
        assert!(err.to_string().contains("still mounted"));
        assert!(root.is_dir());
    }

    #[test]
    fn preserved_log_sits_beside_the_directory() {
        let layout = WorkLayout::new("/var/tmp/kernel-builder.abc123");
        assert_eq!(
            layout.preserved_log_path(),
            PathBuf::from("/var/tmp/kernel-builder.abc123.log")
        );
    }
}
