//! Aggregate CPU usage from `/proc/stat`.
//!
//! Usage is a delta between two consecutive samples, so the sampler keeps
//! exactly one prior sample. The slot is process-wide and shared by every
//! caller; it sits behind a mutex so concurrent readers each observe a
//! consistent (previous, current) pair.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use super::{TelemetryError, TelemetryResult, read_proc_file};

/// One reading of the seven aggregate `cpu` counters, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSample {
    /// Time in user mode.
    pub user: u64,
    /// Time in user mode with low priority.
    pub nice: u64,
    /// Time in kernel mode.
    pub system: u64,
    /// Idle time.
    pub idle: u64,
    /// Time waiting for I/O.
    pub iowait: u64,
    /// Time servicing hardware interrupts.
    pub irq: u64,
    /// Time servicing softirqs.
    pub softirq: u64,
}

impl CpuSample {
    /// Reads the aggregate `cpu` line of the stat file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or has no well-formed
    /// aggregate line.
    pub fn read(path: &Path) -> TelemetryResult<Self> {
        let content = read_proc_file(path)?;
        Self::parse(&content).ok_or_else(|| TelemetryError::Parse {
            path: path.display().to_string(),
            reason: "no aggregate cpu line".to_string(),
        })
    }

    /// Parses the first `cpu ` line of stat content.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let line = content.lines().find(|line| line.starts_with("cpu "))?;
        let mut fields = line.split_whitespace().skip(1).map(str::parse::<u64>);
        let mut next = || fields.next()?.ok();

        Some(Self {
            user: next()?,
            nice: next()?,
            system: next()?,
            idle: next()?,
            iowait: next()?,
            irq: next()?,
            softirq: next()?,
        })
    }

    /// Ticks spent idle, including I/O wait.
    #[must_use]
    pub const fn idle_ticks(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Ticks across all seven counters.
    #[must_use]
    pub const fn total_ticks(&self) -> u64 {
        self.idle_ticks()
            .saturating_add(self.user)
            .saturating_add(self.nice)
            .saturating_add(self.system)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
    }
}

/// Single-slot holder of the previously observed sample.
///
/// Starts from an all-zero sample, so the first reading reports the average
/// usage since boot rather than a recent figure.
#[derive(Debug, Default)]
pub struct CpuSampler {
    previous: Mutex<CpuSample>,
}

impl CpuSampler {
    /// Creates a sampler with an all-zero retained sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the retained sample.
    pub fn reset_to(&self, sample: CpuSample) {
        *self.previous.lock().unwrap_or_else(PoisonError::into_inner) = sample;
    }

    /// Returns the retained sample.
    #[must_use]
    pub fn previous(&self) -> CpuSample {
        *self.previous.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Computes usage between the retained sample and `current`, then
    /// retains `current`.
    ///
    /// The result is in `0.0..=100.0`. It is exactly 0 when the total tick
    /// delta is zero. Counters that went backwards (counter reset, hotplug)
    /// contribute a zero delta.
    #[must_use]
    pub fn usage_from(&self, current: CpuSample) -> f32 {
        let previous = {
            let mut slot = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, current)
        };
        usage_between(&previous, &current)
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn usage_between(previous: &CpuSample, current: &CpuSample) -> f32 {
    let total_delta = current.total_ticks().saturating_sub(previous.total_ticks());
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle_ticks().saturating_sub(previous.idle_ticks());
    let busy_delta = total_delta.saturating_sub(idle_delta);

    let percent = 100.0 * busy_delta as f64 / total_delta as f64;
    percent.clamp(0.0, 100.0) as f32
}
