//! Scratch trees with fake host tools for stage tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::Defaults;
use crate::pipeline::BuildContext;
use crate::process::Executor;
use crate::request::{BuildRequest, RequestOptions};
use crate::workdir::WorkLayout;

pub(crate) const VERSION: &str = "6.6.30";

/// A temp tree holding a work directory, persistent stores and a `bin/`
/// searched before the real `PATH`.
pub(crate) struct Sandbox {
    temp: TempDir,
    pub ctx: BuildContext,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::with_options(RequestOptions::default())
    }

    /// A `config_path` left unset points at `<temp>/kernel.config`.
    pub fn with_options(mut options: RequestOptions) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("bin")).unwrap();

        if options.config_path.is_none() {
            options.config_path = Some(root.join("kernel.config"));
        }
        let request = BuildRequest::new(VERSION, options).unwrap();

        let defaults = Defaults {
            mirror: "https://mirror.test/kernel".to_string(),
            scratch_root: root.join("scratch"),
            log_dir: root.join("logs"),
            distfile_dir: root.join("distfiles"),
            deb_dir: root.join("debs"),
            ccache_bin_dir: root.join("ccache-bin"),
            distcc_bin_dir: root.join("distcc-bin"),
            ..Defaults::default()
        };

        let layout = WorkLayout::new(root.join("work"));
        for dir in [layout.root().to_path_buf(), layout.tmp_dir(), layout.build_dir()] {
            fs::create_dir_all(dir).unwrap();
        }
        let exec = Executor::new(layout.tmp_dir()).with_path_prefix(root.join("bin"));

        Self {
            ctx: BuildContext {
                request,
                defaults,
                layout,
                exec,
            },
            temp,
        }
    }

    pub fn bin(&self) -> PathBuf {
        self.temp.path().join("bin")
    }

    /// Install `bin/<name>` running `body` under `/bin/sh`.
    pub fn tool(&self, name: &str, body: &str) {
        write_script(&self.bin().join(name), body);
    }

    pub fn write_config(&self, text: &str) {
        fs::write(self.temp.path().join("kernel.config"), text).unwrap();
    }

    /// File a fake tool can append its invocations to.
    pub fn calls_file(&self, name: &str) -> PathBuf {
        self.temp.path().join(format!("calls-{name}"))
    }

    /// Lines recorded in [`Sandbox::calls_file`], empty if never written.
    pub fn calls(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.calls_file(name))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
