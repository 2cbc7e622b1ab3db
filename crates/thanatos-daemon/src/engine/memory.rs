//! In-memory decision engine.
//!
//! Keeps the bookkeeping a policy engine needs (per-package configuration,
//! launch rules, open unfreeze windows and an event log) without making any
//! freeze, OOM or network decision of its own. The daemon runs it when no
//! other engine is linked in.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{DecisionEngine, EngineServices, EngineStats};
use crate::protocol::messages::{
    AppPolicyConfig, EventKind, EventLogEntry, FrameworkEvent, LaunchRule,
    TemporaryUnfreezeRequest, UnfreezeReason,
};
use crate::timer::TimerId;

/// Default size of the event ring.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

/// Default low-memory threshold (500 MiB).
pub const DEFAULT_LOW_MEMORY_THRESHOLD_KB: u64 = 512_000;

/// [`MemoryEngine`] tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEngineConfig {
    /// Entries kept in the event ring; older entries are dropped.
    pub event_log_capacity: usize,
    /// Maintenance logs a low-memory event below this many kB available.
    pub low_memory_threshold_kb: u64,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            low_memory_threshold_kb: DEFAULT_LOW_MEMORY_THRESHOLD_KB,
        }
    }
}

type RuleKey = (String, String);

/// Bookkeeping-only [`DecisionEngine`].
pub struct MemoryEngine {
    config: MemoryEngineConfig,
    services: Arc<dyn EngineServices>,
    app_configs: RwLock<HashMap<String, AppPolicyConfig>>,
    launch_rules: RwLock<HashMap<RuleKey, bool>>,
    /// Open unfreeze windows by re-freeze timer.
    unfreeze_windows: Mutex<HashMap<TimerId, String>>,
    /// Newest first.
    events: Mutex<VecDeque<EventLogEntry>>,
}

impl MemoryEngine {
    /// Creates an engine calling back into `services`.
    #[must_use]
    pub fn new(config: MemoryEngineConfig, services: Arc<dyn EngineServices>) -> Self {
        Self {
            config,
            services,
            app_configs: RwLock::new(HashMap::new()),
            launch_rules: RwLock::new(HashMap::new()),
            unfreeze_windows: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(config.event_log_capacity)),
        }
    }

    /// Returns the stored configuration of `package`.
    #[must_use]
    pub fn app_config(&self, package: &str) -> Option<AppPolicyConfig> {
        self.app_configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package)
            .cloned()
    }

    /// Number of packages with a stored configuration.
    #[must_use]
    pub fn config_count(&self) -> usize {
        self.app_configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Packages currently inside an unfreeze window.
    #[must_use]
    pub fn unfrozen_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self.windows().values().cloned().collect();
        packages.sort();
        packages
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<TimerId, String>> {
        self.unfreeze_windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, package: &str, description: impl Into<String>) {
        if self.config.event_log_capacity == 0 {
            return;
        }
        let entry = EventLogEntry {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            package_name: package.to_string(),
            description: description.into(),
        };
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_front(entry);
        events.truncate(self.config.event_log_capacity);
    }

    /// Closes the window of `package` early, cancelling its timer.
    fn close_window(&self, package: &str) -> bool {
        let mut windows = self.windows();
        let open: Vec<TimerId> = windows
            .iter()
            .filter(|(_, p)| p.as_str() == package)
            .map(|(id, _)| *id)
            .collect();
        for id in &open {
            windows.remove(id);
            self.services.cancel_timer(*id);
        }
        !open.is_empty()
    }
}

impl DecisionEngine for MemoryEngine {
    fn set_app_config(&self, config: AppPolicyConfig) {
        let package = config.package_name.clone();
        debug!(
            package = %package,
            policy = ?config.policy(),
            freeze_mode = ?config.freeze_mode(),
            "storing app config"
        );
        self.app_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package.clone(), config);
        self.record(&package, "Configuration updated");
    }

    fn set_launch_rule(&self, rule: LaunchRule) {
        debug!(
            source = %rule.source_package,
            target = %rule.target_package,
            allowed = rule.allowed,
            "storing launch rule"
        );
        self.launch_rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((rule.source_package, rule.target_package), rule.allowed);
    }

    fn handle_framework_event(&self, event: FrameworkEvent) {
        let package = if event.target_package.is_empty() {
            event.source_package.as_str()
        } else {
            event.target_package.as_str()
        };

        match event.kind() {
            EventKind::AppForeground => {
                if self.close_window(package) {
                    debug!(package, "foreground closes unfreeze window");
                }
                self.record(package, "App became foreground");
            },
            EventKind::AppBackground => self.record(package, "App became background"),
            EventKind::ScreenOn => self.record("", "Screen ON"),
            EventKind::ScreenOff => self.record("", "Screen OFF"),
            EventKind::Unspecified => {
                debug!(kind = event.kind, package, "ignoring framework event of unknown kind");
            },
        }
    }

    fn request_temporary_unfreeze(&self, request: TemporaryUnfreezeRequest) {
        let reason = UnfreezeReason::try_from(request.reason).unwrap_or(UnfreezeReason::Unspecified);
        let package = request.package_name;
        self.close_window(&package);

        {
            // Held across timer creation so a zero-length window cannot fire
            // before it is registered.
            let mut windows = self.windows();
            let id = self.services.create_oneshot_timer(request.duration_ms);
            if id.is_valid() {
                windows.insert(id, package.clone());
            } else {
                warn!(package = %package, "no timer available, unfreeze window will not expire");
            }
        }

        info!(package = %package, ?reason, duration_ms = request.duration_ms, "temporary unfreeze");
        self.record(&package, format!("Temporarily unfrozen for {reason:?}"));
    }

    fn should_allow_launch(&self, query: &LaunchRule) -> LaunchRule {
        let allowed = self
            .launch_rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(query.source_package.clone(), query.target_package.clone()))
            .copied()
            .unwrap_or(true);

        if !allowed {
            self.record(
                &query.source_package,
                format!("Blocked launch towards {}", query.target_package),
            );
        }
        LaunchRule::new(
            query.source_package.clone(),
            query.target_package.clone(),
            allowed,
        )
    }

    fn runtime_stats(&self) -> EngineStats {
        EngineStats::default()
    }

    fn recent_events(&self, limit: usize) -> Vec<EventLogEntry> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    fn on_timer_fired(&self, id: TimerId) {
        let Some(package) = self.windows().remove(&id) else {
            debug!(%id, "timer fired for a closed window");
            return;
        };
        debug!(%id, package = %package, "unfreeze window elapsed");
        self.record(&package, "Re-freeze window elapsed");
    }

    fn perform_maintenance(&self) {
        let available = self.services.available_memory_kb();
        let threshold = self.config.low_memory_threshold_kb;
        if available > 0 && available < threshold {
            warn!(available_kb = available, threshold_kb = threshold, "low memory");
            self.record("", format!("Low memory detected ({available} kB available)"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::protocol::messages::{FreezeMode, FreezePolicy};

    /// Services double with manual timers.
    #[derive(Default)]
    struct FakeServices {
        next_timer: AtomicU64,
        cancelled: Mutex<Vec<TimerId>>,
        available_kb: AtomicU64,
    }

    impl EngineServices for FakeServices {
        fn create_oneshot_timer(&self, _duration_ms: u64) -> TimerId {
            TimerId::from_raw(self.next_timer.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn cancel_timer(&self, id: TimerId) {
            self.cancelled.lock().unwrap().push(id);
        }

        fn set_oom_score_adj(&self, _pid: i32, _score: i32) {}

        fn available_memory_kb(&self) -> u64 {
            self.available_kb.load(Ordering::SeqCst)
        }

        fn total_memory_kb(&self) -> u64 {
            8_000_000
        }

        fn cpu_usage_percent(&self) -> f32 {
            0.0
        }

        fn execute_shell(&self, _command: &str) -> String {
            String::new()
        }
    }

    fn engine() -> (MemoryEngine, Arc<FakeServices>) {
        let services = Arc::new(FakeServices::default());
        let engine = MemoryEngine::new(MemoryEngineConfig::default(), services.clone());
        (engine, services)
    }

    fn descriptions(engine: &MemoryEngine) -> Vec<String> {
        engine
            .recent_events(usize::MAX)
            .into_iter()
            .map(|e| e.description)
            .collect()
    }

    #[test]
    fn launch_is_allowed_without_a_rule() {
        let (engine, _) = engine();
        let resolved = engine.should_allow_launch(&LaunchRule::query("com.a", "com.b"));

        assert!(resolved.allowed);
        assert_eq!(resolved.source_package, "com.a");
        assert_eq!(resolved.target_package, "com.b");
        assert!(engine.recent_events(10).is_empty());
    }

    #[test]
    fn denied_launch_is_logged() {
        let (engine, _) = engine();
        engine.set_launch_rule(LaunchRule::new("com.a", "com.b", false));

        let resolved = engine.should_allow_launch(&LaunchRule::query("com.a", "com.b"));
        assert!(!resolved.allowed);

        let events = engine.recent_events(10);
        assert_eq!(events[0].package_name, "com.a");
        assert_eq!(events[0].description, "Blocked launch towards com.b");

        // Rules are per ordered pair.
        assert!(engine.should_allow_launch(&LaunchRule::query("com.b", "com.a")).allowed);
    }

    #[test]
    fn config_replaces_previous_one() {
        let (engine, _) = engine();
        engine.set_app_config(AppPolicyConfig {
            package_name: "com.x".to_string(),
            policy: FreezePolicy::Smart.into(),
            ..AppPolicyConfig::default()
        });
        engine.set_app_config(AppPolicyConfig {
            package_name: "com.x".to_string(),
            freeze_mode: FreezeMode::Kill.into(),
            ..AppPolicyConfig::default()
        });

        let stored = engine.app_config("com.x").unwrap();
        assert_eq!(stored.policy(), FreezePolicy::Unspecified);
        assert_eq!(stored.freeze_mode(), FreezeMode::Kill);
        assert_eq!(engine.config_count(), 1);
    }

    #[test]
    fn unfreeze_window_closes_on_timer() {
        let (engine, _) = engine();
        engine.request_temporary_unfreeze(TemporaryUnfreezeRequest {
            package_name: "com.chat".to_string(),
            reason: UnfreezeReason::PushMessage.into(),
            duration_ms: 50,
        });
        assert_eq!(engine.unfrozen_packages(), vec!["com.chat".to_string()]);

        engine.on_timer_fired(TimerId::from_raw(1));
        assert!(engine.unfrozen_packages().is_empty());
        assert_eq!(
            descriptions(&engine),
            vec!["Re-freeze window elapsed", "Temporarily unfrozen for PushMessage"]
        );

        // A second fire for the same id is ignored.
        engine.on_timer_fired(TimerId::from_raw(1));
        assert_eq!(engine.recent_events(10).len(), 2);
    }

    #[test]
    fn foreground_cancels_open_window() {
        let (engine, services) = engine();
        engine.request_temporary_unfreeze(TemporaryUnfreezeRequest {
            package_name: "com.chat".to_string(),
            reason: UnfreezeReason::WidgetUpdate.into(),
            duration_ms: 10_000,
        });
        engine.handle_framework_event(FrameworkEvent {
            kind: EventKind::AppForeground.into(),
            source_package: "1234".to_string(),
            target_package: "com.chat".to_string(),
            timestamp_ms: 0,
        });

        assert!(engine.unfrozen_packages().is_empty());
        assert_eq!(*services.cancelled.lock().unwrap(), vec![TimerId::from_raw(1)]);
        assert_eq!(descriptions(&engine)[0], "App became foreground");
    }

    #[test]
    fn repeated_unfreeze_replaces_window() {
        let (engine, services) = engine();
        for _ in 0..2 {
            engine.request_temporary_unfreeze(TemporaryUnfreezeRequest {
                package_name: "com.chat".to_string(),
                reason: UnfreezeReason::UserInteraction.into(),
                duration_ms: 1_000,
            });
        }

        assert_eq!(engine.unfrozen_packages(), vec!["com.chat".to_string()]);
        assert_eq!(*services.cancelled.lock().unwrap(), vec![TimerId::from_raw(1)]);
    }

    #[test]
    fn event_ring_is_bounded_and_newest_first() {
        let services = Arc::new(FakeServices::default());
        let engine = MemoryEngine::new(
            MemoryEngineConfig {
                event_log_capacity: 3,
                ..MemoryEngineConfig::default()
            },
            services,
        );
        for i in 0..5 {
            engine.handle_framework_event(FrameworkEvent::new(
                EventKind::AppBackground,
                format!("com.app{i}"),
                i,
            ));
        }

        let packages: Vec<String> = engine
            .recent_events(10)
            .into_iter()
            .map(|e| e.package_name)
            .collect();
        assert_eq!(packages, vec!["com.app4", "com.app3", "com.app2"]);
        assert_eq!(engine.recent_events(1).len(), 1);
    }

    #[test]
    fn unknown_event_kinds_are_ignored() {
        let (engine, _) = engine();
        engine.handle_framework_event(FrameworkEvent {
            kind: 77,
            source_package: "com.a".to_string(),
            ..FrameworkEvent::default()
        });
        assert!(engine.recent_events(10).is_empty());
    }

    #[test]
    fn maintenance_logs_low_memory_only_below_threshold() {
        let (engine, services) = engine();

        services.available_kb.store(4_000_000, Ordering::SeqCst);
        engine.perform_maintenance();
        assert!(engine.recent_events(10).is_empty());

        services.available_kb.store(100_000, Ordering::SeqCst);
        engine.perform_maintenance();
        assert_eq!(
            descriptions(&engine),
            vec!["Low memory detected (100000 kB available)"]
        );
    }

    #[test]
    fn reports_no_frozen_apps() {
        let (engine, _) = engine();
        assert_eq!(engine.runtime_stats(), EngineStats::default());
    }
}
