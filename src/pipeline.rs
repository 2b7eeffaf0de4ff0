//! Build orchestration.
//!
//! Stages run strictly in order; the first failure ends the run in
//! [`Stage::Failed`] and nothing after it is attempted.
//!
//! ```text
//! Init → DependenciesInstalled → Acquired → Extracted → Configured
//!      → Compiled → LogSaved → Archived → Done
//! ```
//!
//! Teardown of the work directory is not part of the pipeline: the caller's
//! run guard does it after either terminal state.

use anyhow::Result;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use time::Date;

use crate::acquire::{acquire, extract};
use crate::archive::archive;
use crate::config::Defaults;
use crate::kernel::{compile, configure, detected_cpus};
use crate::preflight::{check_required_tools, required_tools};
use crate::process::Executor;
use crate::request::BuildRequest;
use crate::runlog::{today, RunLog};
use crate::workdir::WorkLayout;

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    Init = 0,
    /// Every host tool the run needs is present.
    DependenciesInstalled = 1,
    /// Verified distfiles are in the cache.
    Acquired = 2,
    /// Source unpacked under `build/linux`.
    Extracted = 3,
    /// `.config` installed and reconciled.
    Configured = 4,
    /// Packages built, built version known.
    Compiled = 5,
    /// Run log copied into the log store.
    LogSaved = 6,
    /// Packages moved into the archive.
    Archived = 7,
    Done = 8,
    Failed = 9,
}

impl Stage {
    /// Successor on success; `None` from a terminal state.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::DependenciesInstalled),
            Stage::DependenciesInstalled => Some(Stage::Acquired),
            Stage::Acquired => Some(Stage::Extracted),
            Stage::Extracted => Some(Stage::Configured),
            Stage::Configured => Some(Stage::Compiled),
            Stage::Compiled => Some(Stage::LogSaved),
            Stage::LogSaved => Some(Stage::Archived),
            Stage::Archived => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "Init"),
            Stage::DependenciesInstalled => write!(f, "DependenciesInstalled"),
            Stage::Acquired => write!(f, "Acquired"),
            Stage::Extracted => write!(f, "Extracted"),
            Stage::Configured => write!(f, "Configured"),
            Stage::Compiled => write!(f, "Compiled"),
            Stage::LogSaved => write!(f, "LogSaved"),
            Stage::Archived => write!(f, "Archived"),
            Stage::Done => write!(f, "Done"),
            Stage::Failed => write!(f, "Failed"),
        }
    }
}

/// Everything a stage needs: what to build, where, and how to run tools.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub request: BuildRequest,
    pub defaults: Defaults,
    pub layout: WorkLayout,
    pub exec: Executor,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub requested_version: String,
    pub built_version: String,
    pub log_id: String,
    pub archive_dir: PathBuf,
    pub packages: Vec<String>,
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "requested version: {}", self.requested_version)?;
        writeln!(f, "built version:     {}", self.built_version)?;
        writeln!(f, "log:               {}", self.log_id)?;
        writeln!(f, "packages in {}:", self.archive_dir.display())?;
        for package in &self.packages {
            writeln!(f, "  {package}")?;
        }
        Ok(())
    }
}

/// Tracks the current stage and logs every transition.
#[derive(Debug)]
struct Progress {
    stage: Stage,
}

impl Progress {
    fn advance(&mut self, to: Stage) {
        debug_assert_eq!(self.stage.next(), Some(to));
        tracing::info!(from = %self.stage, to = %to, "stage complete");
        self.stage = to;
    }
}

/// Run every stage for `ctx` on this machine, today.
pub fn run(ctx: &BuildContext, run_log: &RunLog) -> Result<BuildSummary> {
    run_with(ctx, run_log, detected_cpus(), today())
}

/// Run every stage with an explicit processor count and log date.
pub fn run_with(
    ctx: &BuildContext,
    run_log: &RunLog,
    cpus: NonZeroUsize,
    date: Date,
) -> Result<BuildSummary> {
    let mut progress = Progress { stage: Stage::Init };
    let result = run_stages(ctx, run_log, cpus, date, &mut progress);
    if result.is_err() {
        tracing::error!(from = %progress.stage, to = %Stage::Failed, "build failed");
    }
    result
}

fn run_stages(
    ctx: &BuildContext,
    run_log: &RunLog,
    cpus: NonZeroUsize,
    date: Date,
    progress: &mut Progress,
) -> Result<BuildSummary> {
    let version = ctx.request.requested_version();
    tracing::info!(version, work_dir = %ctx.layout.root().display(), "starting build");

    check_required_tools(&ctx.exec, &required_tools(&ctx.request))?;
    progress.advance(Stage::DependenciesInstalled);

    acquire(ctx, version)?;
    progress.advance(Stage::Acquired);

    extract(ctx, version)?;
    progress.advance(Stage::Extracted);

    configure(ctx)?;
    progress.advance(Stage::Configured);

    let built_version = compile(ctx, cpus)?;
    if built_version != version {
        tracing::info!(
            requested = version,
            built = %built_version,
            "built version differs from requested; archiving under the built one"
        );
    }
    progress.advance(Stage::Compiled);

    let log_id = run_log.promote(&ctx.defaults.log_dir, date)?;
    tracing::info!(log_id = %log_id, log_dir = %ctx.defaults.log_dir.display(), "run log saved");
    progress.advance(Stage::LogSaved);

    let archived = archive(ctx, &built_version, &log_id)?;
    progress.advance(Stage::Archived);

    progress.advance(Stage::Done);
    Ok(BuildSummary {
        requested_version: version.to_string(),
        built_version,
        log_id,
        archive_dir: archived.dir,
        packages: archived.info.packages.into_iter().map(|p| p.name).collect(),
    })
}
