//! One-shot timers hosted on the event loop.
//!
//! The scheduler owns every live timer as a slot in a map keyed by
//! [`TimerId`]. A slot is released exactly once, through a single release
//! path shared by the "fired" and "cancelled" transitions; whichever comes
//! second finds no slot and does nothing.
//!
//! # Invariants
//!
//! - Identifiers start at 1 and are never reused while the process is
//!   alive. 0 is [`TimerId::INVALID`].
//! - At most one slot exists per identifier.
//! - A slot is removed before the engine's callback runs, so cancelling the
//!   firing timer from inside the callback is a no-op.
//! - Allocation, cancellation and fire-time cleanup take the same mutex,
//!   which is never held across the engine callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::engine::DecisionEngine;
use crate::event_loop::EventLoopHandle;

/// Process-unique timer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Sentinel returned when a timer could not be created.
    pub const INVALID: Self = Self(0);

    /// Wraps a raw identifier (as carried by an engine or the wire).
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `false` for [`TimerId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// A live timer owned by the scheduler.
#[derive(Debug)]
struct TimerSlot {
    deadline: Instant,
    task: AbortHandle,
}

#[derive(Clone)]
struct Binding {
    event_loop: EventLoopHandle,
    engine: Weak<dyn DecisionEngine>,
}

struct SchedulerState {
    binding: Option<Binding>,
    next_id: u64,
    slots: HashMap<TimerId, TimerSlot>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            binding: None,
            next_id: 1,
            slots: HashMap::new(),
        }
    }
}

impl SchedulerState {
    fn allocate_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Single release path for both the fired and the cancelled transition.
    fn release(&mut self, id: TimerId) -> Option<TimerSlot> {
        self.slots.remove(&id)
    }
}

/// Creates, cancels and fires one-shot timers on the event loop.
///
/// Cheap to clone; clones share the same timer set. Safe to use from any
/// thread while the loop is running.
#[derive(Clone, Default)]
pub struct TimerScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl TimerScheduler {
    /// Creates an unbound scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the scheduler to an event loop and the engine whose
    /// `on_timer_fired` receives expiries.
    ///
    /// The engine is held weakly: the engine usually owns a handle back to
    /// this scheduler, and a strong reference here would form a cycle.
    pub fn bind(&self, event_loop: EventLoopHandle, engine: Weak<dyn DecisionEngine>) {
        self.lock().binding = Some(Binding { event_loop, engine });
        debug!("timer scheduler bound to event loop");
    }

    /// Detaches from the event loop and cancels every active timer.
    ///
    /// Returns the number of timers cancelled. Later `create_oneshot` calls
    /// yield [`TimerId::INVALID`].
    pub fn unbind(&self) -> usize {
        let drained: Vec<TimerSlot> = {
            let mut state = self.lock();
            state.binding = None;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.task.abort();
        }
        debug!(cancelled = drained.len(), "timer scheduler unbound");
        drained.len()
    }

    /// Returns `true` once [`TimerScheduler::bind`] has been called.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.lock().binding.is_some()
    }

    /// Registers a timer firing once after `duration_ms` and returns its id.
    ///
    /// Does not block. Returns [`TimerId::INVALID`] (and logs) when the
    /// scheduler is not bound to an event loop.
    pub fn create_oneshot(&self, duration_ms: u64) -> TimerId {
        let mut state = self.lock();
        let Some(binding) = state.binding.clone() else {
            error!(duration_ms, "timer requested before the event loop was bound");
            return TimerId::INVALID;
        };

        let id = state.allocate_id();
        let deadline = Instant::now() + Duration::from_millis(duration_ms);
        let scheduler = Arc::downgrade(&self.state);
        let engine = binding.engine;

        // The task cannot observe its own slot before the insert below: firing
        // takes this same lock, which is held until the slot is in place.
        let task = binding.event_loop.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(&scheduler, &engine, id);
        });

        state.slots.insert(
            id,
            TimerSlot {
                deadline,
                task: task.abort_handle(),
            },
        );
        trace!(%id, duration_ms, "timer created");
        id
    }

    /// Cancels `id` if it is still active. Returns whether a timer was
    /// cancelled; unknown, fired and already-cancelled ids are a no-op.
    pub fn cancel(&self, id: TimerId) -> bool {
        let released = self.lock().release(id);
        match released {
            Some(slot) => {
                slot.task.abort();
                trace!(%id, "timer cancelled");
                true
            },
            None => false,
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Returns `true` if `id` is pending.
    #[must_use]
    pub fn is_active(&self, id: TimerId) -> bool {
        self.lock().slots.contains_key(&id)
    }

    /// Returns the deadline of a pending timer.
    #[must_use]
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.lock().slots.get(&id).map(|slot| slot.deadline)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TimerScheduler")
            .field("bound", &state.binding.is_some())
            .field("next_id", &state.next_id)
            .field("active", &state.slots.len())
            .finish()
    }
}

/// Expiry path, running on the event-loop thread.
fn fire(
    scheduler: &Weak<Mutex<SchedulerState>>,
    engine: &Weak<dyn DecisionEngine>,
    id: TimerId,
) {
    let Some(state) = scheduler.upgrade() else {
        return;
    };
    let released = state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .release(id);
    if released.is_none() {
        // Lost the race against cancel().
        return;
    }

    match engine.upgrade() {
        Some(engine) => {
            trace!(%id, "timer fired");
            engine.on_timer_fired(id);
        },
        None => debug!(%id, "timer fired after the engine was dropped"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::OnceLock;
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::engine::EngineStats;
    use crate::event_loop::{EVENT_LOOP_THREAD_NAME, EventLoop, EventLoopThread};
    use crate::protocol::messages::{
        AppPolicyConfig, EventLogEntry, FrameworkEvent, LaunchRule, TemporaryUnfreezeRequest,
    };

    #[derive(Debug)]
    struct Firing {
        id: TimerId,
        at: std::time::Instant,
        thread: Option<String>,
        cancel_result: Option<bool>,
    }

    /// Engine double that records timer callbacks and optionally cancels the
    /// firing id from inside the callback.
    #[derive(Default)]
    struct FiringLog {
        firings: Mutex<Vec<Firing>>,
        reentrant: OnceLock<TimerScheduler>,
    }

    impl FiringLog {
        fn ids(&self) -> Vec<TimerId> {
            self.firings.lock().unwrap().iter().map(|f| f.id).collect()
        }
    }

    impl DecisionEngine for FiringLog {
        fn set_app_config(&self, _config: AppPolicyConfig) {}
        fn set_launch_rule(&self, _rule: LaunchRule) {}
        fn handle_framework_event(&self, _event: FrameworkEvent) {}
        fn request_temporary_unfreeze(&self, _request: TemporaryUnfreezeRequest) {}
        fn should_allow_launch(&self, query: &LaunchRule) -> LaunchRule {
            query.clone()
        }
        fn runtime_stats(&self) -> EngineStats {
            EngineStats::default()
        }
        fn recent_events(&self, _limit: usize) -> Vec<EventLogEntry> {
            Vec::new()
        }
        fn on_timer_fired(&self, id: TimerId) {
            let cancel_result = self.reentrant.get().map(|scheduler| scheduler.cancel(id));
            self.firings.lock().unwrap().push(Firing {
                id,
                at: std::time::Instant::now(),
                thread: thread::current().name().map(str::to_string),
                cancel_result,
            });
        }
    }

    fn bound_scheduler() -> (TimerScheduler, Arc<FiringLog>, EventLoopThread) {
        let event_loop = EventLoop::start_thread().unwrap();
        let log = Arc::new(FiringLog::default());
        let engine: Arc<dyn DecisionEngine> = log.clone();
        let scheduler = TimerScheduler::new();
        scheduler.bind(event_loop.handle().clone(), Arc::downgrade(&engine));
        (scheduler, log, event_loop)
    }

    #[test]
    fn unbound_scheduler_returns_invalid_id() {
        let scheduler = TimerScheduler::new();

        let id = scheduler.create_oneshot(10);

        assert_eq!(id, TimerId::INVALID);
        assert!(!id.is_valid());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let (scheduler, _log, _loop) = bound_scheduler();

        let first = scheduler.create_oneshot(60_000);
        let second = scheduler.create_oneshot(60_000);

        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);
        assert!(scheduler.is_active(first));
        assert!(scheduler.deadline(second).is_some());
    }

    #[test]
    fn fires_exactly_once_not_before_deadline() {
        let (scheduler, log, _loop) = bound_scheduler();
        let created = std::time::Instant::now();

        let first = scheduler.create_oneshot(50);
        let second = scheduler.create_oneshot(50);
        assert!(first.is_valid());
        assert_ne!(first, second);

        thread::sleep(Duration::from_millis(100));

        let firings = log.firings.lock().unwrap();
        let of_first: Vec<&Firing> = firings.iter().filter(|f| f.id == first).collect();
        assert_eq!(of_first.len(), 1);
        assert!(of_first[0].at.duration_since(created) >= Duration::from_millis(50));
        assert_eq!(of_first[0].thread.as_deref(), Some(EVENT_LOOP_THREAD_NAME));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn cancel_prevents_firing_and_is_idempotent() {
        let (scheduler, log, _loop) = bound_scheduler();

        let id = scheduler.create_oneshot(30);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(!scheduler.cancel(TimerId::INVALID));
        assert!(!scheduler.cancel(TimerId::from_raw(9999)));

        thread::sleep(Duration::from_millis(80));
        assert!(log.ids().is_empty());
    }

    #[test]
    fn cancelling_a_fired_timer_is_a_noop() {
        let (scheduler, log, _loop) = bound_scheduler();

        let id = scheduler.create_oneshot(0);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(log.ids(), vec![id]);
        assert!(!scheduler.cancel(id));
        assert_eq!(log.ids(), vec![id]);
    }

    #[test]
    fn cancel_from_inside_callback_is_safe() {
        let (scheduler, log, _loop) = bound_scheduler();
        log.reentrant.set(scheduler.clone()).unwrap();

        let id = scheduler.create_oneshot(5);
        thread::sleep(Duration::from_millis(60));

        let firings = log.firings.lock().unwrap();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].id, id);
        assert_eq!(firings[0].cancel_result, Some(false));
    }

    #[test]
    fn dropped_engine_still_releases_slot() {
        let event_loop = EventLoop::start_thread().unwrap();
        let scheduler = TimerScheduler::new();
        {
            let engine: Arc<dyn DecisionEngine> = Arc::new(FiringLog::default());
            scheduler.bind(event_loop.handle().clone(), Arc::downgrade(&engine));
        }

        let id = scheduler.create_oneshot(1);
        thread::sleep(Duration::from_millis(50));

        assert!(!scheduler.is_active(id));
    }

    #[test]
    fn unbind_cancels_pending_timers() {
        let (scheduler, log, _loop) = bound_scheduler();
        scheduler.create_oneshot(20);
        scheduler.create_oneshot(20);

        assert_eq!(scheduler.unbind(), 2);
        assert_eq!(scheduler.create_oneshot(1), TimerId::INVALID);

        thread::sleep(Duration::from_millis(60));
        assert!(log.ids().is_empty());
    }

    #[test]
    fn concurrent_create_and_cancel_from_many_threads() {
        let (scheduler, _log, _loop) = bound_scheduler();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| scheduler.create_oneshot(60_000))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let ids: Vec<TimerId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let unique: HashSet<TimerId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert!(!unique.contains(&TimerId::INVALID));
        assert_eq!(scheduler.active_count(), 800);

        let chunks: Vec<Vec<TimerId>> = ids.chunks(100).map(<[TimerId]>::to_vec).collect();
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let scheduler = scheduler.clone();
                thread::spawn(move || chunk.into_iter().filter(|id| scheduler.cancel(*id)).count())
            })
            .collect();
        let cancelled: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(cancelled, 800);
        assert_eq!(scheduler.active_count(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn ids_are_pairwise_distinct(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let (scheduler, _log, _loop) = bound_scheduler();
            let mut seen = HashSet::new();
            let mut last = None;

            for cancel_after in ops {
                let id = scheduler.create_oneshot(60_000);
                prop_assert!(id.is_valid());
                prop_assert!(seen.insert(id));
                if let Some(last) = last {
                    prop_assert!(id > last);
                }
                last = Some(id);
                if cancel_after {
                    scheduler.cancel(id);
                }
            }
        }
    }
}
