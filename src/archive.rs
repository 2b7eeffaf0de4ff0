//! Persistent package archive.
//!
//! Layout:
//!
//! ```text
//! <deb_dir>/<built_version>/
//! ├── linux-image-<built_version>_..._amd64.deb
//! ├── linux-headers-..., linux-libc-dev_..., *.buildinfo, *.changes
//! └── build-info.json
//! ```
//!
//! The directory name is the version the compiled kernel reports, not the
//! one that was requested. A directory is written once: archiving the same
//! built version again fails.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::distfile::move_file;
use crate::error::PreconditionError;
use crate::pipeline::BuildContext;

/// Extensions of the files `bindeb-pkg` leaves in the build root.
pub const PACKAGE_EXTENSIONS: &[&str] = &["deb", "buildinfo", "changes"];

/// Manifest written next to the packages.
pub const MANIFEST_NAME: &str = "build-info.json";

const STORE_LOCK_NAME: &str = ".archive.lock";
const STAGING_PREFIX: &str = ".staging-";

/// Mode of a finished archive directory.
const ARCHIVE_DIR_MODE: u32 = 0o755;

/// One archived package file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Contents of `build-info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub requested_version: String,
    pub built_version: String,
    pub log_id: String,
    pub archived_at_unix: u64,
    pub packages: Vec<PackageRecord>,
}

/// Result of [`archive`].
#[derive(Debug, Clone)]
pub struct ArchivedBuild {
    pub dir: PathBuf,
    pub info: BuildInfo,
}

/// Move the packages in the build root into `<deb_dir>/<built_version>`.
///
/// Everything is assembled in a hidden staging directory inside `deb_dir`
/// and renamed into place last, so a failure leaves no archive directory.
pub fn archive(ctx: &BuildContext, built_version: &str, log_id: &str) -> Result<ArchivedBuild> {
    validate_version_segment(built_version)?;

    let packages = package_files(&ctx.layout.build_dir())?;
    if packages.is_empty() {
        bail!(
            "no package files ({}) found in '{}'",
            PACKAGE_EXTENSIONS.join(", "),
            ctx.layout.build_dir().display()
        );
    }
    archive_packages(ctx, &packages, built_version, log_id)
}

fn archive_packages(
    ctx: &BuildContext,
    packages: &[PathBuf],
    built_version: &str,
    log_id: &str,
) -> Result<ArchivedBuild> {
    let deb_dir = &ctx.defaults.deb_dir;
    fs::create_dir_all(deb_dir)
        .with_context(|| format!("creating package store '{}'", deb_dir.display()))?;
    let _lock = StoreLock::acquire(deb_dir)?;

    let dest_dir = deb_dir.join(built_version);
    ensure_unclaimed(&dest_dir, built_version)?;

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(deb_dir)
        .with_context(|| format!("creating staging directory in '{}'", deb_dir.display()))?;

    let mut records = Vec::with_capacity(packages.len());
    for src in packages {
        let Some(name) = src.file_name() else {
            continue;
        };
        let staged = staging.path().join(name);
        move_file(src, &staged)?;
        let (sha256, size_bytes) = sha256_file(&staged)?;
        tracing::info!(package = %name.to_string_lossy(), size_bytes, "archived");
        records.push(PackageRecord {
            name: name.to_string_lossy().into_owned(),
            size_bytes,
            sha256,
        });
    }

    let info = BuildInfo {
        requested_version: ctx.request.requested_version().to_string(),
        built_version: built_version.to_string(),
        log_id: log_id.to_string(),
        archived_at_unix: now_unix(),
        packages: records,
    };
    write_manifest(staging.path(), &info)?;
    fs::set_permissions(staging.path(), fs::Permissions::from_mode(ARCHIVE_DIR_MODE))
        .with_context(|| format!("setting permissions on '{}'", staging.path().display()))?;

    let staged_dir = staging.keep();
    if let Err(e) = fs::rename(&staged_dir, &dest_dir) {
        let _ = fs::remove_dir_all(&staged_dir);
        return Err(e).with_context(|| {
            format!("moving archive into place at '{}'", dest_dir.display())
        });
    }

    Ok(ArchivedBuild {
        dir: dest_dir,
        info,
    })
}

/// Refuse a version that already has an archive directory.
fn ensure_unclaimed(dest_dir: &Path, built_version: &str) -> Result<()> {
    if fs::symlink_metadata(dest_dir).is_ok() {
        return Err(PreconditionError::new(format!(
            "archive directory '{}' already exists; version {} was built before",
            dest_dir.display(),
            built_version
        ))
        .into());
    }
    Ok(())
}

/// Exclusive lock on the package store, held from the existence check to
/// the final rename.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(deb_dir: &Path) -> Result<Self> {
        let path = deb_dir.join(STORE_LOCK_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking package store '{}'", deb_dir.display()))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Package files directly under `build_dir`, sorted by name.
pub fn package_files(build_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(build_dir).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("listing build root '{}'", build_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_package = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| PACKAGE_EXTENSIONS.contains(&ext));
        if is_package {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

fn validate_version_segment(version: &str) -> Result<()> {
    if version.is_empty() {
        bail!("built version must not be empty");
    }
    if version.contains('/') || version.contains('\\') || version.starts_with('.') {
        bail!("built version must be a safe directory name: {version}");
    }
    Ok(())
}

fn write_manifest(dir: &Path, info: &BuildInfo) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(info)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".build-info")
        .tempfile_in(dir)
        .with_context(|| format!("creating manifest in '{}'", dir.display()))?;
    std::io::Write::write_all(&mut tmp, &bytes)?;
    tmp.persist(dir.join(MANIFEST_NAME))
        .map_err(|e| e.error)
        .with_context(|| format!("writing {} in '{}'", MANIFEST_NAME, dir.display()))?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
