//! thanatos-daemon - control plane of the Thanatos resource manager
//!
//! The daemon hosts a decision engine (which decides what to freeze, kill
//! or throttle) and gives it three things: a local-socket RPC surface for
//! the Android framework, a one-shot timer service on a dedicated event
//! loop, and best-effort `/proc` telemetry and actuation.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration ([`DaemonConfig`])
//! - [`daemon`]: bootstrap and lifecycle ([`Daemon`])
//! - [`engine`]: the decision-engine boundary and the in-memory
//!   [`MemoryEngine`]
//! - [`event_loop`]: single-threaded runtime hosting timers and ticks
//! - [`protocol`]: socket transport, framing, handshake and client
//! - [`service`]: the `AppControl`, `System` and `Dashboard` call handlers
//! - [`services`]: [`CoreServices`], the capability set offered to the
//!   engine
//! - [`telemetry`]: `/proc` readers, OOM adjustment and shell execution
//! - [`timer`]: one-shot timers ([`TimerScheduler`])

pub mod config;
pub mod daemon;
pub mod engine;
pub mod event_loop;
pub mod protocol;
pub mod service;
pub mod services;
pub mod telemetry;
pub mod timer;

pub use config::{ConfigError, DaemonConfig};
pub use daemon::{Daemon, DaemonError};
pub use engine::{DecisionEngine, EngineServices, EngineStats, MemoryEngine, MemoryEngineConfig};
pub use services::CoreServices;
pub use telemetry::SystemTelemetry;
pub use timer::{TimerId, TimerScheduler};
