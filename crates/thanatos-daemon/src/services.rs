//! Capability set the core exposes to the decision engine.

use std::sync::Arc;

use tracing::trace;

use crate::engine::EngineServices;
use crate::telemetry::SystemTelemetry;
use crate::timer::{TimerId, TimerScheduler};

/// [`EngineServices`] backed by the timer scheduler and the telemetry
/// layer.
#[derive(Debug, Clone)]
pub struct CoreServices {
    scheduler: TimerScheduler,
    telemetry: Arc<SystemTelemetry>,
}

impl CoreServices {
    /// Combines a scheduler and a telemetry layer.
    #[must_use]
    pub const fn new(scheduler: TimerScheduler, telemetry: Arc<SystemTelemetry>) -> Self {
        Self {
            scheduler,
            telemetry,
        }
    }

    /// The scheduler behind timer calls.
    #[must_use]
    pub const fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    /// The telemetry layer behind `/proc` and shell calls.
    #[must_use]
    pub const fn telemetry(&self) -> &Arc<SystemTelemetry> {
        &self.telemetry
    }
}

impl EngineServices for CoreServices {
    fn create_oneshot_timer(&self, duration_ms: u64) -> TimerId {
        self.scheduler.create_oneshot(duration_ms)
    }

    fn cancel_timer(&self, id: TimerId) {
        if !self.scheduler.cancel(id) {
            trace!(%id, "cancel of inactive timer ignored");
        }
    }

    fn set_oom_score_adj(&self, pid: i32, score: i32) {
        self.telemetry.set_oom_score_adj(pid, score);
    }

    fn available_memory_kb(&self) -> u64 {
        self.telemetry.available_memory_kb()
    }

    fn total_memory_kb(&self) -> u64 {
        self.telemetry.total_memory_kb()
    }

    fn cpu_usage_percent(&self) -> f32 {
        self.telemetry.cpu_usage_percent()
    }

    fn execute_shell(&self, command: &str) -> String {
        self.telemetry.execute_shell(command)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn unbound_scheduler_yields_invalid_timer() {
        let services = CoreServices::new(TimerScheduler::new(), Arc::new(SystemTelemetry::new()));

        assert_eq!(services.create_oneshot_timer(10), TimerId::INVALID);
        services.cancel_timer(TimerId::INVALID);
        services.cancel_timer(TimerId::from_raw(99));
    }

    #[test]
    fn telemetry_calls_read_the_configured_root() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 2048 kB\nMemAvailable: 1024 kB\n",
        )
        .unwrap();
        let telemetry = Arc::new(SystemTelemetry::with_proc_root(dir.path()));
        let services = CoreServices::new(TimerScheduler::new(), telemetry);

        assert_eq!(services.total_memory_kb(), 2048);
        assert_eq!(services.available_memory_kb(), 1024);
        assert!(services.cpu_usage_percent().abs() < f32::EPSILON);
    }

    #[cfg(unix)]
    #[test]
    fn shell_output_is_returned() {
        let services = CoreServices::new(TimerScheduler::new(), Arc::new(SystemTelemetry::new()));
        assert_eq!(services.execute_shell("echo hi"), "hi\n");
    }
}
