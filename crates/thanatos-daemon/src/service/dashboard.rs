//! `Dashboard` service: runtime stats and the recent event log.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{MessageSink, ServiceConfig, StreamEnd, StreamOutcome};
use crate::engine::DecisionEngine;
use crate::protocol::messages::{EventLogEntry, RecentEventsRequest, RuntimeStatsSnapshot};
use crate::telemetry::SystemTelemetry;

/// Telemetry streaming for the dashboard.
pub struct DashboardService {
    engine: Arc<dyn DecisionEngine>,
    telemetry: Arc<SystemTelemetry>,
    config: ServiceConfig,
}

impl DashboardService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        engine: Arc<dyn DecisionEngine>,
        telemetry: Arc<SystemTelemetry>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            engine,
            telemetry,
            config,
        }
    }

    /// Computes a fresh snapshot. Nothing is cached between calls.
    #[must_use]
    pub fn snapshot(&self) -> RuntimeStatsSnapshot {
        let engine = self.engine.runtime_stats();
        RuntimeStatsSnapshot {
            total_mem_kb: self.telemetry.total_memory_kb(),
            avail_mem_kb: self.telemetry.available_memory_kb(),
            frozen_app_count: engine.frozen_app_count,
            cpu_usage_percent: self.telemetry.cpu_usage_percent(),
            network_speed_bps: engine.network_speed_bps,
        }
    }

    /// `StreamRuntimeStats`: writes a snapshot every stats interval until
    /// `cancel` fires or a write fails.
    ///
    /// The wait between snapshots races against `cancel`, so once it fires
    /// no further snapshot is written.
    pub async fn stream_runtime_stats<S>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> StreamOutcome
    where
        S: MessageSink<RuntimeStatsSnapshot>,
    {
        let mut written = 0;
        loop {
            if cancel.is_cancelled() {
                return StreamOutcome::new(written, StreamEnd::Cancelled);
            }
            if !sink.write(self.snapshot()).await {
                debug!(written, "stats subscriber disconnected");
                return StreamOutcome::new(written, StreamEnd::PeerGone);
            }
            written += 1;

            tokio::select! {
                () = cancel.cancelled() => {
                    return StreamOutcome::new(written, StreamEnd::Cancelled);
                },
                () = tokio::time::sleep(self.config.stats_interval) => {},
            }
        }
    }

    /// `GetRecentEvents`: writes up to the effective limit of entries in the
    /// engine's order (most recent first).
    pub async fn get_recent_events<S>(
        &self,
        request: RecentEventsRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> StreamOutcome
    where
        S: MessageSink<EventLogEntry>,
    {
        let limit = self.effective_limit(request.limit);
        let entries = self.engine.recent_events(limit as usize);

        let mut written = 0;
        for entry in entries.into_iter().take(limit as usize) {
            if cancel.is_cancelled() {
                return StreamOutcome::new(written, StreamEnd::Cancelled);
            }
            if !sink.write(entry).await {
                return StreamOutcome::new(written, StreamEnd::PeerGone);
            }
            written += 1;
        }
        StreamOutcome::new(written, StreamEnd::Completed)
    }

    /// The number of entries a request for `requested` gets: 0 selects the
    /// configured limit, anything else is capped by it.
    #[must_use]
    pub fn effective_limit(&self, requested: u32) -> u32 {
        match requested {
            0 => self.config.recent_events_limit,
            n => n.min(self.config.recent_events_limit),
        }
    }
}
