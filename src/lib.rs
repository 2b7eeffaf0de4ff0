//! Build Debian kernel packages from upstream kernel.org releases.
//!
//! One run fetches and verifies a release (or takes it from the distfile
//! cache), unpacks it into a private work directory, applies a base config,
//! compiles it with the kernel's own packaging target and archives the
//! resulting packages under the version the compiled kernel reports.
//!
//! # Architecture
//!
//! ```text
//! kernel-builder (binary)
//!     │
//!     ├── RunGuard ────────── owns work dir + run log, tears down exactly once
//!     │                       (dispose, Drop, or SIGINT/SIGTERM/SIGHUP)
//!     │
//!     └── pipeline::run
//!             ├── preflight      host tools present
//!             ├── acquire        curl → unxz → gpg --verify → distfile cache
//!             ├── extract        tar into build/linux
//!             ├── kernel         olddefconfig, bindeb-pkg, version banner
//!             ├── runlog         promote log to build-<date>-<NNN>
//!             └── archive        <deb_dir>/<built version>/
//! ```
//!
//! Every external program is started through [`process::Executor`], which
//! captures its output in the work directory and turns a non-zero exit into
//! an [`error::CommandFailed`].
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_builder::{BuildRequest, Defaults, RequestOptions, RunGuard};
//!
//! let guard = RunGuard::new();
//! guard.watch_signals()?;
//! let defaults = Defaults::load()?;
//! let request = BuildRequest::new("6.6.30", RequestOptions::default())?;
//! let layout = guard.create_work_dir(&defaults.scratch_root, None)?;
//! // ... run the pipeline, then:
//! guard.dispose()?;
//! ```

pub mod acquire;
pub mod archive;
pub mod cleanup;
pub mod config;
pub mod distfile;
pub mod error;
pub mod kernel;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod request;
pub mod runlog;
pub mod workdir;

#[cfg(test)]
mod testutil;

pub use cleanup::RunGuard;
pub use config::Defaults;
pub use error::{CommandFailed, PreconditionError};
pub use pipeline::{BuildContext, BuildSummary, Stage};
pub use process::Executor;
pub use request::{BuildRequest, CrossTarget, RequestOptions};
pub use runlog::{init_tracing, RunLog};
pub use workdir::{WorkDir, WorkLayout};
