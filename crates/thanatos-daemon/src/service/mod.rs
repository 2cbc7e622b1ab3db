//! RPC facade: the three service groups.
//!
//! Services translate wire messages into engine and telemetry calls. They
//! know nothing about sockets: streamed calls read from a [`MessageSource`]
//! and write to a [`MessageSink`], which the transport implements over a
//! connection and tests implement over channels.
//!
//! Every call reports success to the transport regardless of the engine's
//! inner outcome; the engine boundary has no error channel.

pub mod app_control;
pub mod dashboard;
pub mod system;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::DecisionEngine;
use crate::telemetry::SystemTelemetry;

pub use app_control::AppControlService;
pub use dashboard::DashboardService;
pub use system::SystemService;

/// Destination of a server-streamed call.
pub trait MessageSink<T>: Send {
    /// Writes one message. Returns `false` if the peer is gone, after which
    /// the stream must stop.
    fn write(&mut self, item: T) -> impl Future<Output = bool> + Send;
}

/// Origin of a client-streamed call.
pub trait MessageSource<T>: Send {
    /// Reads the next message, or `None` once the stream has ended for any
    /// reason (half-close, cancellation, disconnect).
    fn read(&mut self) -> impl Future<Output = Option<T>> + Send;
}

/// Why a streamed call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// All messages were transferred.
    Completed,
    /// The call's cancellation token fired.
    Cancelled,
    /// A write failed because the peer disconnected.
    PeerGone,
}

/// Result of a streamed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Messages transferred before the stream stopped.
    pub messages: usize,
    /// Why it stopped.
    pub end: StreamEnd,
}

impl StreamOutcome {
    pub(crate) const fn new(messages: usize, end: StreamEnd) -> Self {
        Self { messages, end }
    }
}

/// Tunables of the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Cadence of `StreamRuntimeStats`.
    pub stats_interval: Duration,
    /// Entries returned by `GetRecentEvents` and upper bound on a requested
    /// limit.
    pub recent_events_limit: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(1),
            recent_events_limit: 50,
        }
    }
}

/// The three service groups, shared by every connection.
#[derive(Clone)]
pub struct RpcServices {
    /// App-policy control.
    pub app_control: Arc<AppControlService>,
    /// Event ingestion and launch decisions.
    pub system: Arc<SystemService>,
    /// Telemetry streaming.
    pub dashboard: Arc<DashboardService>,
}

impl RpcServices {
    /// Builds all three groups over one engine and one telemetry layer.
    #[must_use]
    pub fn new(
        engine: Arc<dyn DecisionEngine>,
        telemetry: Arc<SystemTelemetry>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            app_control: Arc::new(AppControlService::new(Arc::clone(&engine))),
            system: Arc::new(SystemService::new(Arc::clone(&engine))),
            dashboard: Arc::new(DashboardService::new(engine, telemetry, config)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed sinks and sources.

    use tokio::sync::mpsc;

    use super::{MessageSink, MessageSource};

    /// Sink forwarding into an mpsc channel; fails once the receiver is gone.
    pub struct ChannelSink<T>(pub mpsc::Sender<T>);

    impl<T: Send> MessageSink<T> for ChannelSink<T> {
        async fn write(&mut self, item: T) -> bool {
            self.0.send(item).await.is_ok()
        }
    }

    /// Sink collecting into a vector.
    #[derive(Default)]
    pub struct VecSink<T>(pub Vec<T>);

    impl<T: Send> MessageSink<T> for VecSink<T> {
        async fn write(&mut self, item: T) -> bool {
            self.0.push(item);
            true
        }
    }

    /// Source reading from an mpsc channel; ends when all senders drop.
    pub struct ChannelSource<T>(pub mpsc::Receiver<T>);

    impl<T: Send> MessageSource<T> for ChannelSource<T> {
        async fn read(&mut self) -> Option<T> {
            self.0.recv().await
        }
    }
}
