use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use kernel_builder::pipeline::{self, BuildContext, BuildSummary};
use kernel_builder::{init_tracing, BuildRequest, Defaults, Executor, RequestOptions, RunGuard, RunLog};

#[derive(Parser, Debug)]
#[command(name = "kernel-builder", version)]
#[command(about = "Build Debian kernel packages from a verified kernel.org release")]
struct Cli {
    /// Kernel release to build (e.g. 6.6.30)
    #[arg(value_name = "VERSION")]
    kernel_version: String,

    /// Base kernel config (default: /boot/config-<running release>)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use this path as the work directory; it must not exist yet
    #[arg(short, long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Build on a tmpfs mounted over the work directory's build subtree
    #[arg(short, long)]
    tmpfs: bool,

    /// Leave the work directory in place after the run
    #[arg(short, long)]
    keep_work_dir: bool,

    /// Parallel build jobs (default: twice the CPU count)
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Compile through ccache with this cache directory
    #[arg(long, value_name = "DIR")]
    ccache_dir: Option<PathBuf>,

    /// Compile through distcc
    #[arg(long)]
    distcc: bool,

    /// Cross-compile for this kernel architecture (e.g. arm64)
    #[arg(long, value_name = "ARCH", requires = "cross_toolchain")]
    cross_arch: Option<String>,

    /// Cross toolchain prefix (e.g. aarch64-linux-gnu-)
    #[arg(long, value_name = "PREFIX", requires = "cross_arch")]
    cross_toolchain: Option<String>,
}

impl Cli {
    fn options(&self) -> RequestOptions {
        RequestOptions {
            config_path: self.config.clone(),
            job_count: self.jobs,
            use_tmpfs: self.tmpfs,
            keep_work_dir: self.keep_work_dir,
            work_dir_override: self.work_dir.clone(),
            cross_arch: self.cross_arch.clone(),
            cross_toolchain: self.cross_toolchain.clone(),
            ccache_dir: self.ccache_dir.clone(),
            distcc: self.distcc,
        }
    }
}

fn main() -> ExitCode {
    // Help and version go to stdout and succeed; usage errors fail.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli) {
        Ok(summary) => {
            print!("{summary}");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}

/// Owns the run guard: whatever `build` does, teardown happens exactly once
/// before this returns.
fn run(cli: &Cli) -> Result<BuildSummary> {
    let guard = RunGuard::new();
    let result = guard.watch_signals().and_then(|()| build(&guard, cli));

    match &result {
        Ok(_) => guard.mark_succeeded(),
        Err(e) => report(e),
    }

    let cleanup = guard.dispose();
    if let Err(e) = &cleanup {
        report(e);
    }
    let summary = result?;
    cleanup?;
    Ok(summary)
}

fn build(guard: &RunGuard, cli: &Cli) -> Result<BuildSummary> {
    let defaults = Defaults::load()?;
    let request = BuildRequest::new(&cli.kernel_version, cli.options())?;

    let layout = guard.create_work_dir(
        &defaults.scratch_root,
        request.work_dir_override().map(PathBuf::as_path),
    )?;
    guard.set_keep_work_dir(request.keep_work_dir());

    let run_log = RunLog::create(&layout.log_file())?;
    init_tracing(&run_log)?;
    guard.attach_log(run_log.clone());
    tracing::info!(work_dir = %layout.root().display(), "created work directory");

    let exec = Executor::new(layout.tmp_dir()).with_active_child(guard.active_child());
    guard.mount_scratch(&exec, request.use_tmpfs())?;

    let ctx = BuildContext {
        request,
        defaults,
        layout,
        exec,
    };
    pipeline::run(&ctx, &run_log)
}

/// Into the run log once logging is up, straight to stderr before that.
fn report(e: &anyhow::Error) {
    if tracing::dispatcher::has_been_set() {
        tracing::error!("{e:#}");
    } else {
        eprintln!("kernel-builder: {e:#}");
    }
}
