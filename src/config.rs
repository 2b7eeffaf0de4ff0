//! Named defaults for a build run.
//!
//! Resolution order (later wins, key by key):
//! 1. Built-in values
//! 2. System file: `KERNEL_BUILDER_CONFIG` env var, else `/etc/kernel-builder.toml`
//! 3. Per-user file: `<config dir>/kernel-builder/config.toml`
//!
//! Missing files are skipped. A file that exists but does not parse is an error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// System-wide config file location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/kernel-builder.toml";

/// Env var overriding [`SYSTEM_CONFIG_PATH`].
pub const CONFIG_ENV: &str = "KERNEL_BUILDER_CONFIG";

/// kernel.org release signing keys (Linus Torvalds, Greg Kroah-Hartman).
pub const KERNEL_ORG_KEYS: &[&str] = &[
    "ABAF11C65A2970B130ABE3C479BE3E4300411886",
    "647F28654894E3BD457199BE38DBBDC86092693E",
];

/// Fully resolved defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    /// Base URL of the kernel.org mirror (no trailing slash).
    pub mirror: String,
    /// Directory under which per-run work directories are created.
    pub scratch_root: PathBuf,
    /// Persistent store for logs of successful runs.
    pub log_dir: PathBuf,
    /// Persistent cache of verified tarballs and signatures.
    pub distfile_dir: PathBuf,
    /// Persistent store for built packages, one subdirectory per built version.
    pub deb_dir: PathBuf,
    /// Keyserver used for `import_keys`.
    pub keyserver: String,
    /// Key fingerprints imported before verification. Empty disables import.
    pub import_keys: Vec<String>,
    /// Directory holding ccache's compiler masquerade links.
    pub ccache_bin_dir: PathBuf,
    /// Directory holding distcc's compiler masquerade links.
    pub distcc_bin_dir: PathBuf,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            mirror: "https://cdn.kernel.org/pub/linux/kernel".to_string(),
            scratch_root: PathBuf::from("/var/tmp"),
            log_dir: PathBuf::from("/var/log/kernel-builder"),
            distfile_dir: PathBuf::from("/var/cache/kernel-builder/distfiles"),
            deb_dir: PathBuf::from("/var/cache/kernel-builder/debs"),
            keyserver: "hkps://keyserver.ubuntu.com".to_string(),
            import_keys: KERNEL_ORG_KEYS.iter().map(|k| k.to_string()).collect(),
            ccache_bin_dir: PathBuf::from("/usr/lib/ccache"),
            distcc_bin_dir: PathBuf::from("/usr/lib/distcc"),
        }
    }
}

/// One config file as written on disk; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsToml {
    mirror: Option<String>,
    scratch_root: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    distfile_dir: Option<PathBuf>,
    deb_dir: Option<PathBuf>,
    keyserver: Option<String>,
    import_keys: Option<Vec<String>>,
    ccache_bin_dir: Option<PathBuf>,
    distcc_bin_dir: Option<PathBuf>,
}

impl Defaults {
    /// Load defaults from the system and per-user config files.
    pub fn load() -> Result<Self> {
        let system = env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH));
        let user = dirs::config_dir().map(|dir| dir.join("kernel-builder/config.toml"));

        let mut files = vec![system];
        files.extend(user);
        Self::load_from(&files)
    }

    /// Layer the given files, in order, over the built-in values.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut defaults = Self::default();
        for path in paths {
            if let Some(layer) = read_layer(path)? {
                defaults.apply(layer);
            }
        }
        defaults.mirror = defaults.mirror.trim_end_matches('/').to_string();
        Ok(defaults)
    }

    fn apply(&mut self, layer: DefaultsToml) {
        if let Some(v) = layer.mirror {
            self.mirror = v;
        }
        if let Some(v) = layer.scratch_root {
            self.scratch_root = v;
        }
        if let Some(v) = layer.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = layer.distfile_dir {
            self.distfile_dir = v;
        }
        if let Some(v) = layer.deb_dir {
            self.deb_dir = v;
        }
        if let Some(v) = layer.keyserver {
            self.keyserver = v;
        }
        if let Some(v) = layer.import_keys {
            self.import_keys = v
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect();
        }
        if let Some(v) = layer.ccache_bin_dir {
            self.ccache_bin_dir = v;
        }
        if let Some(v) = layer.distcc_bin_dir {
            self.distcc_bin_dir = v;
        }
    }
}

fn read_layer(path: &Path) -> Result<Option<DefaultsToml>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file '{}'", path.display()))?;
    let layer = toml::from_str(&text)
        .with_context(|| format!("parsing config file '{}'", path.display()))?;
    Ok(Some(layer))
}
