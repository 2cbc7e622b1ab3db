//! `System` service: framework event ingestion and launch decisions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{MessageSource, StreamEnd, StreamOutcome};
use crate::engine::DecisionEngine;
use crate::protocol::messages::{Empty, FrameworkEvent, LaunchRule, TemporaryUnfreezeRequest};

/// Event ingestion and launch decisions.
pub struct SystemService {
    engine: Arc<dyn DecisionEngine>,
}

impl SystemService {
    /// Creates the service.
    #[must_use]
    pub fn new(engine: Arc<dyn DecisionEngine>) -> Self {
        Self { engine }
    }

    /// `PushFrameworkEvents`: forwards each event to the engine in arrival
    /// order until the source ends or `cancel` fires.
    ///
    /// Cancellation stops the loop between events; an event already handed
    /// to the engine is never interrupted.
    pub async fn push_framework_events<S>(
        &self,
        events: &mut S,
        cancel: &CancellationToken,
    ) -> StreamOutcome
    where
        S: MessageSource<FrameworkEvent>,
    {
        let mut forwarded = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(forwarded, "PushFrameworkEvents cancelled");
                    return StreamOutcome::new(forwarded, StreamEnd::Cancelled);
                },
                next = events.read() => next,
            };
            let Some(event) = next else {
                return StreamOutcome::new(forwarded, StreamEnd::Completed);
            };
            self.engine.handle_framework_event(event);
            forwarded += 1;
        }
    }

    /// `RequestTemporaryUnfreeze`: fire-and-forget forward.
    pub fn request_temporary_unfreeze(&self, request: TemporaryUnfreezeRequest) -> Empty {
        debug!(
            package = %request.package_name,
            duration_ms = request.duration_ms,
            "RequestTemporaryUnfreeze"
        );
        self.engine.request_temporary_unfreeze(request);
        Empty {}
    }

    /// `ShouldAllowLaunch`: returns the engine's verdict with the query's own
    /// source and target echoed back.
    pub fn should_allow_launch(&self, query: LaunchRule) -> LaunchRule {
        let resolved = self.engine.should_allow_launch(&query);
        LaunchRule {
            allowed: resolved.allowed,
            ..query
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::EngineStats;
    use crate::protocol::messages::{AppPolicyConfig, EventKind, EventLogEntry};
    use crate::service::testing::ChannelSource;
    use crate::timer::TimerId;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<FrameworkEvent>>,
        deny: Mutex<Vec<(String, String)>>,
    }

    impl DecisionEngine for Recorder {
        fn set_app_config(&self, _config: AppPolicyConfig) {}
        fn set_launch_rule(&self, _rule: LaunchRule) {}
        fn handle_framework_event(&self, event: FrameworkEvent) {
            self.events.lock().unwrap().push(event);
        }
        fn request_temporary_unfreeze(&self, _request: TemporaryUnfreezeRequest) {}
        fn should_allow_launch(&self, query: &LaunchRule) -> LaunchRule {
            let denied = self.deny.lock().unwrap().iter().any(|(s, t)| {
                *s == query.source_package && *t == query.target_package
            });
            // Empty pair: the service, not the engine, echoes the query.
            LaunchRule::new("", "", !denied)
        }
        fn runtime_stats(&self) -> EngineStats {
            EngineStats::default()
        }
        fn recent_events(&self, _limit: usize) -> Vec<EventLogEntry> {
            Vec::new()
        }
        fn on_timer_fired(&self, _id: TimerId) {}
    }

    fn service() -> (SystemService, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (SystemService::new(recorder.clone()), recorder)
    }

    #[test]
    fn should_allow_launch_echoes_source_and_target() {
        let (service, recorder) = service();
        recorder
            .deny
            .lock()
            .unwrap()
            .push(("com.a".to_string(), "com.b".to_string()));

        let denied = service.should_allow_launch(LaunchRule::query("com.a", "com.b"));
        assert_eq!(denied, LaunchRule::new("com.a", "com.b", false));

        let allowed = service.should_allow_launch(LaunchRule::query("com.b", "com.a"));
        assert_eq!(allowed, LaunchRule::new("com.b", "com.a", true));
    }

    #[tokio::test]
    async fn events_are_forwarded_in_arrival_order() {
        let (service, recorder) = service();
        let (tx, rx) = mpsc::channel(16);
        for ts in 0..10 {
            tx.send(FrameworkEvent::new(EventKind::AppForeground, format!("com.app{ts}"), ts))
                .await
                .unwrap();
        }
        drop(tx);

        let outcome = service
            .push_framework_events(&mut ChannelSource(rx), &CancellationToken::new())
            .await;

        assert_eq!(outcome, StreamOutcome::new(10, StreamEnd::Completed));
        let timestamps: Vec<i64> = recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.timestamp_ms)
            .collect();
        assert_eq!(timestamps, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancellation_stops_without_error() {
        let (service, recorder) = service();
        let (tx, rx) = mpsc::channel(16);
        tx.send(FrameworkEvent::new(EventKind::ScreenOff, "", 1))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let mut source = ChannelSource(rx);
        let push = service.push_framework_events(&mut source, &cancel);
        tokio::pin!(push);

        // The sender stays open, so only cancellation can end the call.
        tokio::select! {
            _ = &mut push => panic!("stream ended while sender was open"),
            () = tokio::time::sleep(std::time::Duration::from_millis(20)) => {},
        }
        cancel.cancel();
        let outcome = push.await;

        assert_eq!(outcome, StreamOutcome::new(1, StreamEnd::Cancelled));
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        drop(tx);
    }
}
