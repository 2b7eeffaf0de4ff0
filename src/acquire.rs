//! Acquisition and extraction of a kernel.org release.
//!
//! ```text
//! cache hit?  ── yes ──> done, no network
//!     │ no
//! curl linux-<v>.tar.sign, linux-<v>.tar.xz   (private name, then rename)
//! unxz --keep                                  (tarball for verification)
//! gpg --recv-keys <each configured key>        (best effort)
//! gpg --verify linux-<v>.tar.sign linux-<v>.tar
//! move .sign + .xz into the distfile cache, delete the .tar
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::distfile::{download_url, file_name, tarball_name, DistfileCache, DistfileKind};
use crate::error::PreconditionError;
use crate::pipeline::BuildContext;
use crate::process::Executor;

/// How [`acquire`] satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Both files were already cached; nothing was fetched.
    Cached,
    /// Downloaded, verified and stored.
    Downloaded,
}

/// Make sure the verified distfiles for `version` are in the cache.
pub fn acquire(ctx: &BuildContext, version: &str) -> Result<AcquireOutcome> {
    let cache = DistfileCache::new(&ctx.defaults.distfile_dir);
    let _lock = cache.lock(version)?;

    if cache.is_cached(version) {
        tracing::info!(version, cache = %cache.dir().display(), "distfiles already cached");
        return Ok(AcquireOutcome::Cached);
    }

    let staging = ctx.layout.tmp_dir();
    for kind in DistfileKind::ALL {
        let url = download_url(&ctx.defaults.mirror, version, kind)?;
        download(&ctx.exec, &url, &staging.join(file_name(version, kind)))?;
    }

    let archive = staging.join(file_name(version, DistfileKind::Archive));
    let signature = staging.join(file_name(version, DistfileKind::Signature));
    let tarball = staging.join(tarball_name(version));

    ctx.exec
        .cmd("unxz")
        .args(["--keep", "--force"])
        .arg(&archive)
        .error_msg(format!("decompressing {}", archive.display()))
        .run()?;

    import_keys(&ctx.exec, &ctx.defaults.keyserver, &ctx.defaults.import_keys)?;

    ctx.exec
        .cmd("gpg")
        .args(["--batch", "--verify"])
        .arg(&signature)
        .arg(&tarball)
        .error_msg(format!("signature verification failed for linux-{version}"))
        .run()?;
    tracing::info!(version, "signature verified");

    cache.store(&signature, version, DistfileKind::Signature)?;
    cache.store(&archive, version, DistfileKind::Archive)?;
    fs::remove_file(&tarball)
        .with_context(|| format!("removing decompressed tarball '{}'", tarball.display()))?;

    tracing::info!(version, cache = %cache.dir().display(), "distfiles cached");
    Ok(AcquireOutcome::Downloaded)
}

/// Unpack the cached archive into the work directory's source tree.
pub fn extract(ctx: &BuildContext, version: &str) -> Result<PathBuf> {
    let cache = DistfileCache::new(&ctx.defaults.distfile_dir);
    let missing = cache.missing(version);
    if !missing.is_empty() {
        let list: Vec<String> = missing
            .iter()
            .map(|p| format!("  {}", p.display()))
            .collect();
        return Err(PreconditionError::new(format!(
            "distfiles for linux-{version} are not cached:\n{}",
            list.join("\n")
        ))
        .into());
    }

    let source = ctx.layout.source_dir();
    fs::create_dir_all(&source)
        .with_context(|| format!("creating source directory '{}'", source.display()))?;

    ctx.exec
        .cmd("tar")
        .arg("-xJf")
        .arg(cache.path(version, DistfileKind::Archive))
        .arg("-C")
        .arg(&source)
        .arg("--strip-components=1")
        .error_msg(format!("extracting linux-{version}"))
        .run()?;

    tracing::info!(source = %source.display(), "source extracted");
    Ok(source)
}

/// Fetch `url` to `dest` through a private name, so an interrupted transfer
/// never appears under the final name.
fn download(exec: &Executor, url: &str, dest: &Path) -> Result<()> {
    let dir = dest
        .parent()
        .with_context(|| format!("download target '{}' has no parent", dest.display()))?;
    let partial = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".part")
        .tempfile_in(dir)
        .with_context(|| format!("creating download file in '{}'", dir.display()))?
        .into_temp_path();

    tracing::info!(url, "downloading");
    exec.cmd("curl")
        .args(["--fail", "--location", "--silent", "--show-error", "-o"])
        .arg(partial.as_os_str())
        .arg(url)
        .error_msg(format!("downloading {url}"))
        .run()?;

    partial
        .persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("moving download into place at '{}'", dest.display()))?;
    Ok(())
}

/// Import each key from `keyserver`. Failures are logged and skipped:
/// the keys may already be in the keyring.
fn import_keys(exec: &Executor, keyserver: &str, keys: &[String]) -> Result<()> {
    for key in keys {
        let result = exec
            .cmd("gpg")
            .args(["--batch", "--keyserver", keyserver, "--recv-keys", key])
            .allow_fail()
            .run()?;
        if result.success() {
            tracing::info!(key = %key, "imported signing key");
        } else {
            tracing::warn!(key = %key, status = %result.status, "could not import signing key");
        }
    }
    Ok(())
}
