//! Validated build request.

use anyhow::Result;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use crate::error::PreconditionError;

/// Architecture and toolchain prefix for a cross build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossTarget {
    /// Kernel `ARCH=` value, e.g. `arm64`.
    pub arch: String,
    /// Toolchain prefix passed as `CROSS_COMPILE=`, e.g. `aarch64-linux-gnu-`.
    pub toolchain: String,
}

/// Options as supplied by the caller, before validation.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub config_path: Option<PathBuf>,
    pub job_count: Option<usize>,
    pub use_tmpfs: bool,
    pub keep_work_dir: bool,
    pub work_dir_override: Option<PathBuf>,
    pub cross_arch: Option<String>,
    pub cross_toolchain: Option<String>,
    pub ccache_dir: Option<PathBuf>,
    pub distcc: bool,
}

/// Everything one run needs to know about what to build. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    requested_version: String,
    config_path: Option<PathBuf>,
    job_count: Option<NonZeroUsize>,
    use_tmpfs: bool,
    keep_work_dir: bool,
    work_dir_override: Option<PathBuf>,
    cross: Option<CrossTarget>,
    ccache_dir: Option<PathBuf>,
    distcc: bool,
}

impl BuildRequest {
    pub fn new(requested_version: &str, options: RequestOptions) -> Result<Self> {
        let requested_version = requested_version.trim();
        validate_release_version(requested_version)?;

        let job_count = match options.job_count {
            Some(0) => {
                return Err(PreconditionError::new("job count must be a positive integer").into())
            }
            Some(n) => NonZeroUsize::new(n),
            None => None,
        };

        let cross = match (options.cross_arch, options.cross_toolchain) {
            (None, None) => None,
            (Some(arch), Some(toolchain)) => {
                let arch = arch.trim().to_string();
                let toolchain = toolchain.trim().to_string();
                if arch.is_empty() || toolchain.is_empty() {
                    return Err(PreconditionError::new(
                        "cross-compilation architecture and toolchain must not be empty",
                    )
                    .into());
                }
                Some(CrossTarget { arch, toolchain })
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(PreconditionError::new(
                    "cross-compilation needs both an architecture and a toolchain prefix",
                )
                .into())
            }
        };

        Ok(Self {
            requested_version: requested_version.to_string(),
            config_path: options.config_path,
            job_count,
            use_tmpfs: options.use_tmpfs,
            keep_work_dir: options.keep_work_dir,
            work_dir_override: options.work_dir_override,
            cross,
            ccache_dir: options.ccache_dir,
            distcc: options.distcc,
        })
    }

    pub fn requested_version(&self) -> &str {
        &self.requested_version
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    pub fn job_count(&self) -> Option<NonZeroUsize> {
        self.job_count
    }

    pub fn use_tmpfs(&self) -> bool {
        self.use_tmpfs
    }

    pub fn keep_work_dir(&self) -> bool {
        self.keep_work_dir
    }

    pub fn work_dir_override(&self) -> Option<&PathBuf> {
        self.work_dir_override.as_ref()
    }

    pub fn cross(&self) -> Option<&CrossTarget> {
        self.cross.as_ref()
    }

    pub fn ccache_dir(&self) -> Option<&PathBuf> {
        self.ccache_dir.as_ref()
    }

    pub fn distcc(&self) -> bool {
        self.distcc
    }

    /// Parallelism for the build: the requested job count, else twice the
    /// detected processor count.
    pub fn jobs(&self, detected_cpus: NonZeroUsize) -> usize {
        match self.job_count {
            Some(n) => n.get(),
            None => detected_cpus.get().saturating_mul(2),
        }
    }

    /// Toolchain prefix for binutils-style tools (`strings`, `gcc`); empty
    /// for native builds.
    pub fn tool_prefix(&self) -> &str {
        self.cross.as_ref().map_or("", |c| c.toolchain.as_str())
    }
}

/// Accept `<major>.<minor>[.<patch>]` with numeric components.
///
/// The version is spliced into mirror URLs and cache file names, so nothing
/// else gets through.
pub fn validate_release_version(version: &str) -> Result<()> {
    if version.is_empty() {
        return Err(PreconditionError::new("kernel version must not be empty").into());
    }
    let parts: Vec<&str> = version.split('.').collect();
    let well_formed = (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !well_formed {
        return Err(PreconditionError::new(format!(
            "unsupported kernel version '{version}'; expected <major>.<minor>[.<patch>], e.g. 6.6.30"
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cross_opts(arch: Option<&str>, toolchain: Option<&str>) -> RequestOptions {
        RequestOptions {
            cross_arch: arch.map(str::to_string),
            cross_toolchain: toolchain.map(str::to_string),
            ..Default::default()
        }
    }

    fn is_precondition(err: &anyhow::Error) -> bool {
        err.downcast_ref::<PreconditionError>().is_some()
    }

    #[test]
    fn default_jobs_are_twice_the_cpu_count() {
        let request = BuildRequest::new("6.6.30", RequestOptions::default()).unwrap();
        let four = NonZeroUsize::new(4).unwrap();
        assert_eq!(request.jobs(four), 8);
    }

    #[test]
    fn explicit_jobs_win() {
        let opts = RequestOptions {
            job_count: Some(3),
            ..Default::default()
        };
        let request = BuildRequest::new("6.6.30", opts).unwrap();
        assert_eq!(request.jobs(NonZeroUsize::new(16).unwrap()), 3);
    }

    #[test]
    fn zero_jobs_is_a_precondition_error() {
        let opts = RequestOptions {
            job_count: Some(0),
            ..Default::default()
        };
        let err = BuildRequest::new("6.6.30", opts).unwrap_err();
        assert!(is_precondition(&err));
    }

    #[test]
    fn cross_options_are_both_or_neither() {
        let only_arch = BuildRequest::new("6.6.30", cross_opts(Some("arm64"), None)).unwrap_err();
        assert!(is_precondition(&only_arch));

        let only_toolchain =
            BuildRequest::new("6.6.30", cross_opts(None, Some("aarch64-linux-gnu-"))).unwrap_err();
        assert!(is_precondition(&only_toolchain));

        let neither = BuildRequest::new("6.6.30", cross_opts(None, None)).unwrap();
        assert!(neither.cross().is_none());
        assert_eq!(neither.tool_prefix(), "");

        let both =
            BuildRequest::new("6.6.30", cross_opts(Some("arm64"), Some("aarch64-linux-gnu-")))
                .unwrap();
        assert_eq!(both.cross().unwrap().arch, "arm64");
        assert_eq!(both.tool_prefix(), "aarch64-linux-gnu-");
    }

    #[test]
    fn version_shape_is_checked() {
        for good in ["6.6", "6.6.30", "4.19.316"] {
            assert!(validate_release_version(good).is_ok(), "{good}");
        }
        for bad in ["", "6", "6.6.30.1", "6.6-rc1", "../6.6", "v6.6"] {
            assert!(validate_release_version(bad).is_err(), "{bad}");
        }
    }
}
