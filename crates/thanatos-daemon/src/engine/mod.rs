//! Decision-engine boundary.
//!
//! The policy brain (freeze, OOM and network decisions) lives behind two
//! capability sets:
//!
//! - [`DecisionEngine`]: what the daemon core calls into. Implemented by the
//!   engine.
//! - [`EngineServices`]: what the core offers back to the engine (timers,
//!   `/proc` telemetry and actuation, shell). Implemented by
//!   [`crate::services::CoreServices`].
//!
//! Both are plain traits so either side can be swapped for a test double.
//!
//! # Concurrency contract
//!
//! A `DecisionEngine` is shared as `Arc<dyn DecisionEngine>` and is called
//! concurrently from every RPC worker and from the event-loop thread (timer
//! callbacks and maintenance ticks). Implementations must synchronise
//! internally and must not hold their own locks while calling back into
//! [`EngineServices`] in a way that could wait on the event loop.
//!
//! [`DecisionEngine::on_timer_fired`] and [`DecisionEngine::perform_maintenance`]
//! run on the event-loop thread and block every other timer while they run;
//! they must schedule work and return quickly.
//!
//! # Errors
//!
//! The boundary is infallible. Engines log and absorb their own failures;
//! every RPC reports success regardless of the engine's inner outcome.

pub mod memory;

use crate::protocol::messages::{
    AppPolicyConfig, EventLogEntry, FrameworkEvent, LaunchRule, TemporaryUnfreezeRequest,
};
use crate::timer::TimerId;

pub use memory::{MemoryEngine, MemoryEngineConfig};

/// Engine-supplied part of a runtime stats snapshot.
///
/// Memory and CPU figures are filled in by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of applications currently frozen.
    pub frozen_app_count: u32,
    /// Network throughput in bits per second.
    pub network_speed_bps: u64,
}

/// Capability set consumed by the core.
pub trait DecisionEngine: Send + Sync {
    /// Replaces the whole policy configuration for `config.package_name`.
    fn set_app_config(&self, config: AppPolicyConfig);

    /// Records a launch permission for the (source, target) pair.
    fn set_launch_rule(&self, rule: LaunchRule);

    /// Handles one framework event. Called in arrival order per stream.
    fn handle_framework_event(&self, event: FrameworkEvent);

    /// Temporarily lifts a freeze for `request.duration_ms`.
    fn request_temporary_unfreeze(&self, request: TemporaryUnfreezeRequest);

    /// Resolves the effective permission for `query`'s (source, target)
    /// pair and returns it with the same source and target.
    fn should_allow_launch(&self, query: &LaunchRule) -> LaunchRule;

    /// Returns the engine-owned part of the runtime stats.
    fn runtime_stats(&self) -> EngineStats;

    /// Returns up to `limit` event log entries, most recent first.
    fn recent_events(&self, limit: usize) -> Vec<EventLogEntry>;

    /// Called on the event-loop thread when timer `id` fires.
    ///
    /// The timer is already retired: cancelling `id` from here is a no-op.
    fn on_timer_fired(&self, id: TimerId);

    /// Periodic housekeeping, called on the event-loop thread.
    fn perform_maintenance(&self) {}
}

/// Capability set exposed to the engine.
///
/// Every method is best effort and never fails: telemetry readers return 0,
/// actuation failures are swallowed, and an unbound scheduler yields
/// [`TimerId::INVALID`].
pub trait EngineServices: Send + Sync {
    /// Schedules a one-shot timer; see [`crate::timer::TimerScheduler::create_oneshot`].
    fn create_oneshot_timer(&self, duration_ms: u64) -> TimerId;

    /// Cancels a timer if it is still active.
    fn cancel_timer(&self, id: TimerId);

    /// Adjusts the OOM score of `pid`.
    fn set_oom_score_adj(&self, pid: i32, score: i32);

    /// `MemAvailable` in kilobytes.
    fn available_memory_kb(&self) -> u64;

    /// `MemTotal` in kilobytes.
    fn total_memory_kb(&self) -> u64;

    /// System-wide CPU usage in percent.
    fn cpu_usage_percent(&self) -> f32;

    /// Runs a shell command and returns its merged output.
    fn execute_shell(&self, command: &str) -> String;
}
