//! Daemon configuration.
//!
//! Loaded from a TOML file. Every section and key is optional:
//!
//! ```toml
//! [server]
//! socket_path = "/data/local/tmp/thanatosd.sock"
//! socket_mode = 0o660
//! max_connections = 64
//!
//! [dashboard]
//! stats_interval_ms = 1000
//! recent_events_limit = 50
//!
//! [engine]
//! maintenance_interval_secs = 60
//! event_log_capacity = 500
//! low_memory_threshold_kb = 512000
//!
//! [telemetry]
//! proc_root = "/proc"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::MemoryEngineConfig;
use crate::engine::memory::{DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_LOW_MEMORY_THRESHOLD_KB};
use crate::protocol::ServerConfig;
use crate::protocol::server::{DEFAULT_MAX_CONNECTIONS, DEFAULT_SOCKET_MODE, default_server_info};
use crate::service::ServiceConfig;
use crate::telemetry::DEFAULT_PROC_ROOT;

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/data/local/tmp/thanatosd.sock";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Socket settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Stats and event-log RPC settings.
    #[serde(default)]
    pub dashboard: DashboardSection,

    /// Engine and maintenance settings.
    #[serde(default)]
    pub engine: EngineSection,

    /// `/proc` access.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// `[server]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Unix socket path.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Mode of the socket file.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Connections served at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            max_connections: default_max_connections(),
        }
    }
}

/// `[dashboard]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DashboardSection {
    /// Cadence of `StreamRuntimeStats`.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Default and maximum number of entries from `GetRecentEvents`.
    #[serde(default = "default_recent_events_limit")]
    pub recent_events_limit: u32,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            stats_interval_ms: default_stats_interval_ms(),
            recent_events_limit: default_recent_events_limit(),
        }
    }
}

/// `[engine]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Period of the engine's maintenance tick.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Size of the in-memory event log.
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    /// Available memory below which maintenance reports low memory.
    #[serde(default = "default_low_memory_threshold_kb")]
    pub low_memory_threshold_kb: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: default_maintenance_interval_secs(),
            event_log_capacity: default_event_log_capacity(),
            low_memory_threshold_kb: default_low_memory_threshold_kb(),
        }
    }
}

/// `[telemetry]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Procfs mount point.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

const fn default_socket_mode() -> u32 {
    DEFAULT_SOCKET_MODE
}

const fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

const fn default_stats_interval_ms() -> u64 {
    1000
}

const fn default_recent_events_limit() -> u32 {
    50
}

const fn default_maintenance_interval_secs() -> u64 {
    60
}

const fn default_event_log_capacity() -> usize {
    DEFAULT_EVENT_LOG_CAPACITY
}

const fn default_low_memory_threshold_kb() -> u64 {
    DEFAULT_LOW_MEMORY_THRESHOLD_KB
}

fn default_proc_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROC_ROOT)
}

impl DaemonConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, has unknown keys, or fails
    /// [`DaemonConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Rejects zero intervals and limits, an empty socket path, and socket
    /// modes outside `0o777`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.socket_path.as_os_str().is_empty() {
            return Err(invalid("server.socket_path must not be empty"));
        }
        if self.server.socket_mode > 0o777 {
            return Err(ConfigError::Validation(format!(
                "server.socket_mode {:o} is not a permission mode",
                self.server.socket_mode
            )));
        }
        let positive = [
            ("server.max_connections", self.server.max_connections as u64),
            ("dashboard.stats_interval_ms", self.dashboard.stats_interval_ms),
            (
                "dashboard.recent_events_limit",
                u64::from(self.dashboard.recent_events_limit),
            ),
            (
                "engine.maintenance_interval_secs",
                self.engine.maintenance_interval_secs,
            ),
            ("engine.event_log_capacity", self.engine.event_log_capacity as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{key} must be greater than 0")));
        }
        Ok(())
    }

    /// Socket server settings.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            socket_path: self.server.socket_path.clone(),
            socket_mode: self.server.socket_mode,
            max_connections: self.server.max_connections,
            server_info: default_server_info(),
        }
    }

    /// RPC facade settings.
    #[must_use]
    pub const fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            stats_interval: Duration::from_millis(self.dashboard.stats_interval_ms),
            recent_events_limit: self.dashboard.recent_events_limit,
        }
    }

    /// Reference engine settings.
    #[must_use]
    pub const fn engine_config(&self) -> MemoryEngineConfig {
        MemoryEngineConfig {
            event_log_capacity: self.engine.event_log_capacity,
            low_memory_threshold_kb: self.engine.low_memory_threshold_kb,
        }
    }

    /// Period of the maintenance tick.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.engine.maintenance_interval_secs)
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Validation(reason.to_string())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();

        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.server.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.server.socket_mode, 0o660);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.service_config(), ServiceConfig::default());
        assert_eq!(config.engine_config(), MemoryEngineConfig::default());
        assert_eq!(config.maintenance_interval(), Duration::from_secs(60));
        assert_eq!(config.telemetry.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            [server]
            socket_path = "/tmp/thanatos/test.sock"
            socket_mode = 0o600

            [dashboard]
            stats_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/thanatos/test.sock"));
        assert_eq!(config.server.socket_mode, 0o600);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.service_config().stats_interval, Duration::from_millis(250));
        assert_eq!(config.dashboard.recent_events_limit, 50);
        assert_eq!(config.engine, EngineSection::default());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = DaemonConfig::from_toml("[dashboard]\nstats_interval_ms = 0\n").unwrap_err();
        match err {
            ConfigError::Validation(reason) => {
                assert!(reason.contains("dashboard.stats_interval_ms"), "{reason}");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_limits_are_rejected() {
        for toml in [
            "[server]\nmax_connections = 0\n",
            "[dashboard]\nrecent_events_limit = 0\n",
            "[engine]\nmaintenance_interval_secs = 0\n",
            "[engine]\nevent_log_capacity = 0\n",
        ] {
            assert!(
                matches!(DaemonConfig::from_toml(toml), Err(ConfigError::Validation(_))),
                "{toml}"
            );
        }
    }

    #[test]
    fn bad_socket_mode_is_rejected() {
        let err = DaemonConfig::from_toml("[server]\nsocket_mode = 0o4777\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DaemonConfig::from_toml("[server]\nsocket = \"/tmp/x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_round_trip_preserves_config() {
        let mut config = DaemonConfig::default();
        config.engine.low_memory_threshold_kb = 1024;
        let parsed = DaemonConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = DaemonConfig::from_file(Path::new("/nonexistent/thanatosd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
