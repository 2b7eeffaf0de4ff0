//! Aggregate run log.
//!
//! Everything the run prints goes through `tracing`, whose writer is a
//! [`TeeWriter`]: each formatted line is written to stderr and to the log
//! file while one mutex is held, so the file is a byte-for-byte copy of
//! the console.
//!
//! On success the file is copied into the log store as
//! `build-<YYYYMMDD>-<NNN>`. On any other exit it is moved next to the work
//! directory by the run guard.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use time::{Date, OffsetDateTime};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Log files are readable by owner and group only.
const LOG_MODE: u32 = 0o640;

/// Handle to the aggregate log file of one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RunLog {
    /// Create the log file. It must not exist yet.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(LOG_MODE)
            .open(path)
            .with_context(|| format!("creating run log '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> TeeWriter {
        TeeWriter {
            file: Arc::clone(&self.file),
        }
    }

    /// Copy the log into `log_dir` under the next free id for `date`.
    /// Returns the id.
    pub fn promote(&self, log_dir: &Path, date: Date) -> Result<String> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log store '{}'", log_dir.display()))?;
        lock(&self.file).flush().context("flushing run log")?;

        let (id, mut dest) = allocate_log_file(log_dir, date)?;
        let mut src = File::open(&self.path)
            .with_context(|| format!("opening run log '{}'", self.path.display()))?;
        io::copy(&mut src, &mut dest)
            .with_context(|| format!("copying run log into '{}'", log_dir.display()))?;
        fs::set_permissions(log_dir.join(&id), fs::Permissions::from_mode(LOG_MODE))
            .with_context(|| format!("restricting permissions on log '{id}'"))?;
        Ok(id)
    }

    /// Move the log file to `dest`. Later writes still land in it.
    pub fn preserve(&self, dest: &Path) -> Result<()> {
        lock(&self.file).flush().context("flushing run log")?;
        if fs::rename(&self.path, dest).is_ok() {
            return Ok(());
        }
        fs::copy(&self.path, dest).with_context(|| {
            format!(
                "copying run log '{}' to '{}'",
                self.path.display(),
                dest.display()
            )
        })?;
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer()
    }
}

/// Writes every buffer to stderr and to the run log.
#[derive(Debug, Clone)]
pub struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = lock(&self.file);
        io::stderr().lock().write_all(buf)?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        lock(&self.file).flush()
    }
}

fn lock(file: &Mutex<File>) -> MutexGuard<'_, File> {
    file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the global `tracing` subscriber writing through `log`.
///
/// Level defaults to `info`; `RUST_LOG` overrides it.
pub fn init_tracing(log: &RunLog) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log.clone())
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))
}

/// Today's date in local time, falling back to UTC when the offset is unknown.
pub fn today() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}

/// `YYYYMMDD`.
pub fn date_stamp(date: Date) -> String {
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// `build-<YYYYMMDD>-<NNN>`. The counter is padded to at least three
/// digits and widens past 999.
pub fn log_id(date: Date, counter: u32) -> String {
    format!("build-{}-{:03}", date_stamp(date), counter)
}

/// Counter following the highest one already used for `date`, or 0.
pub fn next_log_counter(log_dir: &Path, date: Date) -> Result<u32> {
    let prefix = format!("build-{}-", date_stamp(date));
    if !log_dir.is_dir() {
        return Ok(0);
    }
    let mut next = 0;
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("reading log store '{}'", log_dir.display()))?
    {
        let entry = entry.with_context(|| format!("reading log store '{}'", log_dir.display()))?;
        let name = entry.file_name();
        let Some(counter) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|c| c.parse::<u32>().ok())
        else {
            continue;
        };
        next = next.max(counter.saturating_add(1));
    }
    Ok(next)
}

fn allocate_log_file(log_dir: &Path, date: Date) -> Result<(String, File)> {
    let start = next_log_counter(log_dir, date)?;
    for counter in start..=u32::MAX {
        let id = log_id(date, counter);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(LOG_MODE)
            .open(log_dir.join(&id))
        {
            Ok(file) => return Ok((id, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("creating log '{}'", log_dir.join(&id).display())
                })
            }
        }
    }
    bail!(
        "no free log id left for {} in '{}'",
        date_stamp(date),
        log_dir.display()
    )
}
