//! Kernel configuration and compilation.
//!
//! The source tree's own build system does the work: `olddefconfig`
//! reconciles the supplied config, `bindeb-pkg` compiles and writes the
//! Debian packages next to the source tree (the work directory's build
//! root). The built version is read back from the banner embedded in
//! `vmlinux`, since local suffixes can make it differ from the requested one.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::error::PreconditionError;
use crate::pipeline::BuildContext;
use crate::request::BuildRequest;

/// Prefix of the banner compiled into every kernel image.
const BANNER_PREFIX: &str = "Linux version ";

/// Packaging target of the kernel build system.
pub const PACKAGE_TARGET: &str = "bindeb-pkg";

const FALLBACK_CPUS: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Config file of the running kernel: `/boot/config-<release>`.
pub fn running_kernel_config() -> Result<PathBuf> {
    let uts = nix::sys::utsname::uname().context("querying the running kernel release")?;
    let release = uts.release().to_string_lossy();
    Ok(PathBuf::from(format!("/boot/config-{release}")))
}

/// The explicit config path, else the running kernel's; must exist.
pub fn resolve_config_path(request: &BuildRequest) -> Result<PathBuf> {
    let path = match request.config_path() {
        Some(path) => path.clone(),
        None => running_kernel_config()?,
    };
    if !path.is_file() {
        return Err(PreconditionError::new(format!(
            "kernel config '{}' not found; pass one with --config",
            path.display()
        ))
        .into());
    }
    Ok(path)
}

/// Processor count of this machine.
pub fn detected_cpus() -> NonZeroUsize {
    match std::thread::available_parallelism() {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("could not detect CPU count ({e}), assuming {FALLBACK_CPUS}");
            FALLBACK_CPUS
        }
    }
}

/// `make` arguments for `target`, with cross variables when configured.
pub fn make_args(
    request: &BuildRequest,
    source: &Path,
    jobs: Option<usize>,
    target: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-C".into(), source.as_os_str().to_os_string()];
    if let Some(jobs) = jobs {
        args.push(format!("-j{jobs}").into());
    }
    if let Some(cross) = request.cross() {
        args.push(format!("ARCH={}", cross.arch).into());
        args.push(format!("CROSS_COMPILE={}", cross.toolchain).into());
    }
    args.push(target.into());
    args
}

/// Install the base config into the extracted tree and reconcile it,
/// taking the default for every option the config does not mention.
pub fn configure(ctx: &BuildContext) -> Result<()> {
    let source = ctx.layout.source_dir();
    if let Some(cross) = ctx.request.cross() {
        if !source.join("arch").join(&cross.arch).is_dir() {
            return Err(PreconditionError::new(format!(
                "unsupported cross-compilation architecture '{}': no arch/{} in the source tree",
                cross.arch, cross.arch
            ))
            .into());
        }
    }

    let config = resolve_config_path(&ctx.request)?;
    let dest = source.join(".config");
    fs::copy(&config, &dest).with_context(|| {
        format!(
            "copying kernel config '{}' to '{}'",
            config.display(),
            dest.display()
        )
    })?;
    tracing::info!(config = %config.display(), "using kernel config");

    ctx.exec
        .cmd("make")
        .args(make_args(&ctx.request, &source, None, "olddefconfig"))
        .error_msg("kernel config reconciliation failed")
        .run()?;
    Ok(())
}

/// Build the packages and return the version the kernel reports.
pub fn compile(ctx: &BuildContext, cpus: NonZeroUsize) -> Result<String> {
    let source = ctx.layout.source_dir();
    let jobs = ctx.request.jobs(cpus);

    let mut make = ctx
        .exec
        .cmd("make")
        .args(make_args(&ctx.request, &source, Some(jobs), PACKAGE_TARGET))
        .error_msg("kernel build failed");
    if let Some(dir) = ctx.request.ccache_dir() {
        make = make
            .env("CCACHE_DIR", dir)
            .path_prefix(&ctx.defaults.ccache_bin_dir);
    }
    if ctx.request.distcc() {
        make = make.path_prefix(&ctx.defaults.distcc_bin_dir);
    }

    tracing::info!(jobs, make_target = PACKAGE_TARGET, "compiling");
    make.run()?;

    let version = built_version(ctx, &source.join("vmlinux"))?;
    tracing::info!(built_version = %version, "kernel built");
    Ok(version)
}

/// Read the version banner out of a compiled kernel image.
pub fn built_version(ctx: &BuildContext, vmlinux: &Path) -> Result<String> {
    let strings = format!("{}strings", ctx.request.tool_prefix());
    let text = ctx
        .exec
        .cmd(&strings)
        .arg(vmlinux)
        .error_msg(format!("reading strings of '{}'", vmlinux.display()))
        .output()?;

    match parse_version_banner(&text) {
        Some(version) => Ok(version),
        None => bail!(
            "no version banner found in '{}'; cannot name the archive",
            vmlinux.display()
        ),
    }
}

/// First token after `Linux version ` in `text`.
pub fn parse_version_banner(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.split_once(BANNER_PREFIX).map(|(_, rest)| rest))
        .filter_map(|rest| rest.split_whitespace().next())
        .find(|version| !version.is_empty())
        .map(str::to_string)
}
