//! Preflight checks for build validation.
//!
//! Validates that the host has every tool the run is going to invoke,
//! before anything is downloaded.
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_builder::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(&request);
//! check_required_tools(&exec, &tools)?;
//! ```

use anyhow::Result;
use std::path::PathBuf;

use crate::error::PreconditionError;
use crate::process::Executor;
use crate::request::BuildRequest;

/// Tools every build needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("curl", "curl"),
    ("unxz", "xz-utils"),
    ("gpg", "gnupg"),
    ("tar", "tar"),
    ("make", "make"),
    ("bc", "bc"),
    ("flex", "flex"),
    ("bison", "bison"),
    ("dpkg-deb", "dpkg"),
];

/// Tools needed for this particular request: [`REQUIRED_TOOLS`] plus the
/// (possibly prefixed) binutils, cross compiler, tmpfs and compiler-cache
/// helpers it asks for.
pub fn required_tools(request: &BuildRequest) -> Vec<(String, String)> {
    let mut tools: Vec<(String, String)> = REQUIRED_TOOLS
        .iter()
        .map(|(cmd, pkg)| (cmd.to_string(), pkg.to_string()))
        .collect();

    let prefix = request.tool_prefix();
    tools.push((format!("{prefix}strings"), "binutils".to_string()));
    if let Some(cross) = request.cross() {
        tools.push((
            format!("{}gcc", cross.toolchain),
            format!("cross gcc for {}", cross.arch),
        ));
    }
    if request.use_tmpfs() {
        tools.push(("mount".to_string(), "mount".to_string()));
        tools.push(("umount".to_string(), "mount".to_string()));
    }
    if request.ccache_dir().is_some() {
        tools.push(("ccache".to_string(), "ccache".to_string()));
    }
    if request.distcc() {
        tools.push(("distcc".to_string(), "distcc".to_string()));
    }
    tools
}

/// Locate `cmd` on the search path the executor hands to children.
pub fn find_command(exec: &Executor, cmd: &str) -> Option<PathBuf> {
    let path = exec.search_path(&[]).ok()?;
    which::which_in(cmd, Some(path), exec.scratch()).ok()
}

/// Check if a command exists for the executor's children.
pub fn command_exists(exec: &Executor, cmd: &str) -> bool {
    find_command(exec, cmd).is_some()
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` ([`PreconditionError`]) listing every missing tool and its package
pub fn check_required_tools(exec: &Executor, tools: &[(String, String)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(exec, tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(PreconditionError::new(format!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        ))
        .into());
    }

    tracing::info!(count = tools.len(), "host tools present");
    Ok(())
}
