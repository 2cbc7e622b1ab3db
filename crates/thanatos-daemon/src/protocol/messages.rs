//! Wire messages.
//!
//! Hand-derived prost messages mirroring `proto/thanatos.proto` field for
//! field. Enumerated fields are carried as `i32` so values unknown to this
//! build are forwarded to the engine losslessly; the derived accessors
//! (`policy()`, `kind()`, ...) map unknown values to the `Unspecified`
//! variant.

use prost::Message;

/// How aggressively an app is frozen in the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FreezePolicy {
    /// Not set.
    Unspecified = 0,
    /// Never frozen.
    Exempt = 1,
    /// Frozen by engine heuristics.
    Smart = 2,
    /// Frozen as soon as it leaves the foreground.
    StrictBackground = 3,
}

/// Mechanism used to freeze an app.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FreezeMode {
    /// Not set.
    Unspecified = 0,
    /// `SIGSTOP` the process group.
    Sigstop = 1,
    /// Kill the process.
    Kill = 2,
    /// Cgroup freezer.
    Hibernate = 3,
}

/// OOM priority class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum OomPriority {
    /// Not set.
    Unspecified = 0,
    /// Kept alive as long as possible.
    High = 1,
    /// Default kernel treatment.
    Normal = 2,
    /// First candidate for reclaim.
    Low = 3,
}

/// Network access class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NetworkPolicy {
    /// Not set.
    Unspecified = 0,
    /// No restriction.
    FullAccess = 1,
    /// Unmetered networks only.
    WifiOnly = 2,
    /// No network.
    Blocked = 3,
}

/// Kind of a [`FrameworkEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EventKind {
    /// Not set.
    Unspecified = 0,
    /// An app moved to the foreground.
    AppForeground = 1,
    /// An app left the foreground.
    AppBackground = 2,
    /// The display turned on.
    ScreenOn = 3,
    /// The display turned off.
    ScreenOff = 4,
}

/// Why a temporary unfreeze was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum UnfreezeReason {
    /// Not set.
    Unspecified = 0,
    /// A push message arrived.
    PushMessage = 1,
    /// The user interacted with the app.
    UserInteraction = 2,
    /// A home-screen widget needs refreshing.
    WidgetUpdate = 3,
}

/// Call status carried by end-of-stream and error frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    /// Success.
    Ok = 0,
    /// The call was cancelled by either side.
    Cancelled = 1,
    /// The request could not be decoded.
    InvalidArgument = 3,
    /// Unknown method tag.
    Unimplemented = 12,
    /// The server is shutting down.
    Unavailable = 14,
}

/// Full policy configuration for one package. Replaces any previous one.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct AppPolicyConfig {
    /// Package identifier.
    #[prost(string, tag = "1")]
    pub package_name: String,
    /// [`FreezePolicy`] value.
    #[prost(enumeration = "FreezePolicy", tag = "2")]
    pub policy: i32,
    /// [`FreezeMode`] value.
    #[prost(enumeration = "FreezeMode", tag = "3")]
    pub freeze_mode: i32,
    /// [`OomPriority`] value.
    #[prost(enumeration = "OomPriority", tag = "4")]
    pub oom_priority: i32,
    /// [`NetworkPolicy`] value.
    #[prost(enumeration = "NetworkPolicy", tag = "5")]
    pub network_policy: i32,
    /// Whether push messages may wake the app.
    #[prost(bool, tag = "6")]
    pub allow_wakeup_for_push: bool,
    /// Whether the app may start itself.
    #[prost(bool, tag = "7")]
    pub allow_autostart: bool,
}

/// Launch permission for a (source, target) pair.
///
/// Written by `SetLaunchRule`; also the query and answer of
/// `ShouldAllowLaunch`, where `allowed` is the output.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct LaunchRule {
    /// Package starting the launch.
    #[prost(string, tag = "1")]
    pub source_package: String,
    /// Package being launched.
    #[prost(string, tag = "2")]
    pub target_package: String,
    /// Whether the launch is permitted.
    #[prost(bool, tag = "3")]
    pub allowed: bool,
}

impl LaunchRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>, allowed: bool) -> Self {
        Self {
            source_package: source.into(),
            target_package: target.into(),
            allowed,
        }
    }

    /// Creates a query for `ShouldAllowLaunch`; `allowed` is ignored.
    #[must_use]
    pub fn query(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, false)
    }
}

/// An Android framework event.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct FrameworkEvent {
    /// [`EventKind`] value.
    #[prost(enumeration = "EventKind", tag = "1")]
    pub kind: i32,
    /// Package the event concerns.
    #[prost(string, tag = "2")]
    pub source_package: String,
    /// Counterpart package, if any.
    #[prost(string, tag = "3")]
    pub target_package: String,
    /// Event time in milliseconds.
    #[prost(int64, tag = "4")]
    pub timestamp_ms: i64,
}

impl FrameworkEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(kind: EventKind, source: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            kind: kind.into(),
            source_package: source.into(),
            target_package: String::new(),
            timestamp_ms,
        }
    }
}

/// Request to lift a freeze for a while.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct TemporaryUnfreezeRequest {
    /// Package identifier.
    #[prost(string, tag = "1")]
    pub package_name: String,
    /// [`UnfreezeReason`] value.
    #[prost(enumeration = "UnfreezeReason", tag = "2")]
    pub reason: i32,
    /// How long the app stays unfrozen.
    #[prost(uint64, tag = "3")]
    pub duration_ms: u64,
}

/// Point-in-time system figures for the dashboard.
#[derive(Clone, PartialEq, Message)]
pub struct RuntimeStatsSnapshot {
    /// `MemTotal` in kilobytes.
    #[prost(uint64, tag = "1")]
    pub total_mem_kb: u64,
    /// `MemAvailable` in kilobytes.
    #[prost(uint64, tag = "2")]
    pub avail_mem_kb: u64,
    /// Apps the engine currently holds frozen.
    #[prost(uint32, tag = "3")]
    pub frozen_app_count: u32,
    /// System-wide CPU usage, 0 to 100.
    #[prost(float, tag = "4")]
    pub cpu_usage_percent: f32,
    /// Network throughput in bits per second.
    #[prost(uint64, tag = "5")]
    pub network_speed_bps: u64,
}

/// One entry of the engine's event log.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct EventLogEntry {
    /// Wall-clock time in milliseconds since the epoch.
    #[prost(int64, tag = "1")]
    pub timestamp_ms: i64,
    /// Package concerned; empty for system-wide entries.
    #[prost(string, tag = "2")]
    pub package_name: String,
    /// Human-readable description.
    #[prost(string, tag = "3")]
    pub description: String,
}

/// `GetRecentEvents` request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Message)]
pub struct RecentEventsRequest {
    /// Maximum entries wanted; 0 selects the server default.
    #[prost(uint32, tag = "1")]
    pub limit: u32,
}

/// Empty request or acknowledgement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Message)]
pub struct Empty {}

/// Call outcome carried by end-of-stream and error frames.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct RpcStatus {
    /// [`StatusCode`] value.
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    /// Detail for non-OK codes.
    #[prost(string, tag = "2")]
    pub message: String,
}

impl RpcStatus {
    /// Creates a status.
    #[must_use]
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Successful completion.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Returns `true` for [`StatusCode::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code() == StatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_values_survive_a_round_trip() {
        let config = AppPolicyConfig {
            package_name: "com.example".to_string(),
            policy: 42,
            freeze_mode: FreezeMode::Hibernate.into(),
            ..AppPolicyConfig::default()
        };

        let decoded = AppPolicyConfig::decode(config.encode_to_vec().as_slice()).unwrap();

        assert_eq!(decoded.policy, 42);
        assert_eq!(decoded.policy(), FreezePolicy::Unspecified);
        assert_eq!(decoded.freeze_mode(), FreezeMode::Hibernate);
    }

    #[test]
    fn empty_encodes_to_nothing() {
        assert!(Empty {}.encode_to_vec().is_empty());
        assert!(RpcStatus::ok().encode_to_vec().is_empty());
    }

    #[test]
    fn query_shape_matches_rule() {
        let query = LaunchRule::query("com.a", "com.b");
        assert_eq!(query.source_package, "com.a");
        assert_eq!(query.target_package, "com.b");
        assert!(!query.allowed);
    }
}
