//! OS telemetry and actuation over `/proc`.
//!
//! Every primitive here is best effort. `/proc` entries vanish while being
//! read and processes exit between query and mutation, so failures are
//! expected. Internally each reader returns a [`TelemetryResult`]; the public
//! surface collapses failures into a safe default (0, empty, or a sentinel
//! string) through [`BestEffort`] and never propagates an error to callers.
//!
//! ```text
//! <proc_root>/
//! +-- meminfo              # MemTotal / MemAvailable (kB)
//! +-- stat                 # aggregate `cpu` line
//! +-- <pid>/oom_score_adj  # write-only integer
//! ```
//!
//! The root is configurable so tests can point the layer at a synthetic tree.

pub mod cpu;
pub mod meminfo;
pub mod oom;
pub mod shell;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use cpu::{CpuSample, CpuSampler};
pub use shell::SHELL_SPAWN_FAILED;

/// Default mount point of procfs.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Maximum size for a single `/proc` file read (64 KiB).
///
/// `meminfo` and `stat` are a few KiB even on large machines.
pub const MAX_PROC_FILE_SIZE: u64 = 64 * 1024;

/// Telemetry errors.
///
/// These never leave the telemetry layer; see [`BestEffort`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    /// A `/proc` file could not be opened, read or written.
    #[error("i/o failure on '{path}': {source}")]
    Io {
        /// The file involved.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file was read but its content was malformed.
    #[error("failed to parse '{path}': {reason}")]
    Parse {
        /// The file involved.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A labelled field was not present.
    #[error("field '{field}' not found in '{path}'")]
    MissingField {
        /// The file involved.
        path: String,
        /// The label that was looked for.
        field: String,
    },
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Default-on-failure combinator for best-effort OS interaction.
pub trait BestEffort<T> {
    /// Returns the value, or `T::default()` after logging the failure at
    /// debug level.
    fn or_default_logged(self, context: &str) -> T;
}

impl<T: Default> BestEffort<T> for TelemetryResult<T> {
    fn or_default_logged(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                debug!(context, error = %e, "telemetry unavailable, using default");
                T::default()
            },
        }
    }
}

/// Reads a `/proc` file into a string, bounded by [`MAX_PROC_FILE_SIZE`].
pub(crate) fn read_proc_file(path: &Path) -> TelemetryResult<String> {
    let file = File::open(path).map_err(|e| TelemetryError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut reader = BufReader::new(file).take(MAX_PROC_FILE_SIZE);
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| TelemetryError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

    Ok(content)
}

/// Telemetry and actuation rooted at a procfs mount.
///
/// Holds the single process-wide CPU sample slot, so one instance should be
/// shared (behind an `Arc`) by every caller that reports CPU usage.
#[derive(Debug)]
pub struct SystemTelemetry {
    proc_root: PathBuf,
    cpu: CpuSampler,
}

impl SystemTelemetry {
    /// Creates a telemetry layer reading the real `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(DEFAULT_PROC_ROOT)
    }

    /// Creates a telemetry layer rooted at `proc_root`.
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cpu: CpuSampler::new(),
        }
    }

    /// Returns the procfs root in use.
    #[must_use]
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Returns the CPU sampler (exposed for resetting the retained sample).
    #[must_use]
    pub const fn cpu_sampler(&self) -> &CpuSampler {
        &self.cpu
    }

    /// `MemAvailable` in kilobytes, or 0 if unreadable.
    #[must_use]
    pub fn available_memory_kb(&self) -> u64 {
        meminfo::read_field(&self.meminfo_path(), meminfo::MEM_AVAILABLE)
            .or_default_logged("meminfo.available")
    }

    /// `MemTotal` in kilobytes, or 0 if unreadable.
    #[must_use]
    pub fn total_memory_kb(&self) -> u64 {
        meminfo::read_field(&self.meminfo_path(), meminfo::MEM_TOTAL)
            .or_default_logged("meminfo.total")
    }

    /// System-wide CPU usage since the previous call, in `0.0..=100.0`.
    ///
    /// Returns 0 when the stat file is unreadable; the retained sample is
    /// left untouched in that case.
    #[must_use]
    pub fn cpu_usage_percent(&self) -> f32 {
        CpuSample::read(&self.proc_root.join("stat"))
            .map(|current| self.cpu.usage_from(current))
            .or_default_logged("stat.cpu")
    }

    /// Writes `score` to `<proc_root>/<pid>/oom_score_adj`.
    ///
    /// Failure means the process is already gone and is swallowed.
    pub fn set_oom_score_adj(&self, pid: i32, score: i32) {
        oom::write_score(&self.proc_root, pid, score).or_default_logged("oom_score_adj");
    }

    /// Runs `command` through the shell and returns its merged output.
    ///
    /// Returns [`SHELL_SPAWN_FAILED`] if the shell could not be started.
    #[must_use]
    pub fn execute_shell(&self, command: &str) -> String {
        shell::execute(command)
    }

    fn meminfo_path(&self) -> PathBuf {
        self.proc_root.join("meminfo")
    }
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
