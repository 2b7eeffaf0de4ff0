//! Persistent cache of verified release tarballs.
//!
//! A release is cached when both `linux-<v>.tar.xz` and `linux-<v>.tar.sign`
//! sit in the cache directory. Nothing is re-hashed or re-verified on a hit:
//! files only ever enter the cache after `gpg --verify` succeeded.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::request::validate_release_version;

/// The two files making up one cached release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistfileKind {
    /// `linux-<v>.tar.xz`
    Archive,
    /// `linux-<v>.tar.sign`, a detached signature over the uncompressed tarball.
    Signature,
}

impl DistfileKind {
    /// Download order: the small signature first.
    pub const ALL: [DistfileKind; 2] = [DistfileKind::Signature, DistfileKind::Archive];

    pub fn extension(self) -> &'static str {
        match self {
            DistfileKind::Archive => "xz",
            DistfileKind::Signature => "sign",
        }
    }
}

/// `linux-<v>.tar`
pub fn tarball_name(version: &str) -> String {
    format!("linux-{version}.tar")
}

/// `linux-<v>.tar.xz` or `linux-<v>.tar.sign`
pub fn file_name(version: &str, kind: DistfileKind) -> String {
    format!("{}.{}", tarball_name(version), kind.extension())
}

/// `<mirror>/v<major>.x/linux-<v>.tar.{xz,sign}`
pub fn download_url(mirror: &str, version: &str, kind: DistfileKind) -> Result<String> {
    validate_release_version(version)?;
    let major = version.split('.').next().unwrap_or(version);
    Ok(format!(
        "{}/v{}.x/{}",
        mirror.trim_end_matches('/'),
        major,
        file_name(version, kind)
    ))
}

/// The distfile cache directory.
#[derive(Debug, Clone)]
pub struct DistfileCache {
    dir: PathBuf,
}

impl DistfileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, version: &str, kind: DistfileKind) -> PathBuf {
        self.dir.join(file_name(version, kind))
    }

    /// Both files present.
    pub fn is_cached(&self, version: &str) -> bool {
        DistfileKind::ALL
            .iter()
            .all(|kind| self.path(version, *kind).is_file())
    }

    /// Files of `version` not in the cache.
    pub fn missing(&self, version: &str) -> Vec<PathBuf> {
        DistfileKind::ALL
            .iter()
            .map(|kind| self.path(version, *kind))
            .filter(|path| !path.is_file())
            .collect()
    }

    /// Exclusive per-version lock, held for the whole acquisition.
    pub fn lock(&self, version: &str) -> Result<DistfileLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating distfile cache '{}'", self.dir.display()))?;
        let path = self.dir.join(format!(".linux-{version}.lock"));

        // Never unlink the lock file here: a second process could then lock a
        // fresh inode at the same path while this one still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            tracing::info!(lock = %path.display(), "waiting for another run to release the distfile lock");
            file.lock_exclusive()
                .with_context(|| format!("locking '{}'", path.display()))?;
        }
        Ok(DistfileLock { _file: file })
    }

    /// Move a verified file into the cache.
    pub fn store(&self, src: &Path, version: &str, kind: DistfileKind) -> Result<PathBuf> {
        let dest = self.path(version, kind);
        move_file(src, &dest)?;
        Ok(dest)
    }
}

/// Held while a version is being acquired; released on drop.
#[derive(Debug)]
pub struct DistfileLock {
    _file: File,
}

/// Rename `src` to `dst`, falling back to copy + remove across filesystems.
///
/// The copy goes to a temporary sibling of `dst` first, so a reader never
/// sees a half-written file under the final name.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let mut staging = dst.as_os_str().to_os_string();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    fs::copy(src, &staging).with_context(|| {
        format!("Failed to copy {} to {}", src.display(), staging.display())
    })?;
    fs::rename(&staging, dst).with_context(|| {
        format!("Failed to rename {} to {}", staging.display(), dst.display())
    })?;
    fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn urls_follow_the_kernel_org_layout() {
        let mirror = "https://cdn.kernel.org/pub/linux/kernel/";
        assert_eq!(
            download_url(mirror, "6.6.30", DistfileKind::Archive).unwrap(),
            "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.6.30.tar.xz"
        );
        assert_eq!(
            download_url(mirror, "4.19", DistfileKind::Signature).unwrap(),
            "https://cdn.kernel.org/pub/linux/kernel/v4.x/linux-4.19.tar.sign"
        );
        assert!(download_url(mirror, "6.6-rc1", DistfileKind::Archive).is_err());
    }

    #[test]
    fn cached_only_when_both_files_exist() {
        let temp = TempDir::new().unwrap();
        let cache = DistfileCache::new(temp.path());
        assert!(!cache.is_cached("6.6.30"));

        fs::write(cache.path("6.6.30", DistfileKind::Archive), b"xz").unwrap();
        assert!(!cache.is_cached("6.6.30"));
        assert_eq!(
            cache.missing("6.6.30"),
            vec![cache.path("6.6.30", DistfileKind::Signature)]
        );

        fs::write(cache.path("6.6.30", DistfileKind::Signature), b"sig").unwrap();
        assert!(cache.is_cached("6.6.30"));
        assert!(cache.missing("6.6.30").is_empty());
        assert!(!cache.is_cached("6.6.31"));
    }

    #[test]
    fn store_moves_into_place() {
        let temp = TempDir::new().unwrap();
        let cache = DistfileCache::new(temp.path().join("cache"));
        let src = temp.path().join("download.xz");
        fs::write(&src, b"payload").unwrap();

        let dest = cache.store(&src, "6.1", DistfileKind::Archive).unwrap();
        assert_eq!(dest, temp.path().join("cache/linux-6.1.tar.xz"));
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!src.exists());
    }

    #[test]
    fn lock_can_be_retaken_after_release() {
        let temp = TempDir::new().unwrap();
        let cache = DistfileCache::new(temp.path());
        drop(cache.lock("6.6.30").unwrap());
        let _again = cache.lock("6.6.30").unwrap();
    }
}
