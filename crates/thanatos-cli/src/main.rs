//! thanatosctl - operator client for the Thanatos daemon
//!
//! Talks to `thanatosd` over its local socket. Useful on a build host or a
//! rooted device without the framework side installed.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use thanatos_daemon::config::DEFAULT_SOCKET_PATH;
use thanatos_daemon::protocol::messages::{
    EventKind, FreezeMode, FreezePolicy, NetworkPolicy, OomPriority, UnfreezeReason,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// thanatosctl - operator client for the Thanatos daemon
#[derive(Parser, Debug)]
#[command(name = "thanatosctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the daemon's Unix socket
    #[arg(long, env = "THANATOSD_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Dashboard ===
    /// Print runtime stats snapshots
    Stats {
        /// Number of snapshots to print before cancelling the stream
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Print recent daemon events, newest first
    Events {
        /// Maximum number of entries; 0 uses the daemon's default
        #[arg(short, long, default_value_t = 0)]
        limit: u32,
    },

    // === System ===
    /// Ask whether one package may launch another
    CheckLaunch {
        /// Launching package
        source: String,
        /// Launched package
        target: String,
    },

    /// Temporarily unfreeze a package
    Unfreeze {
        /// Package name
        package: String,
        /// Length of the unfreeze window
        #[arg(long, default_value_t = 10_000)]
        duration_ms: u64,
        /// Why the package is unfrozen
        #[arg(long, value_enum, default_value_t = ReasonArg::PushMessage)]
        reason: ReasonArg,
    },

    /// Push a single framework event
    PushEvent {
        /// Event kind
        #[arg(value_enum)]
        kind: EventKindArg,
        /// Source package (or pid for app transitions)
        source: String,
        /// Target package
        target: Option<String>,
    },

    // === App control ===
    /// Store a launch rule
    #[command(group(ArgGroup::new("decision").required(true).args(["allow", "deny"])))]
    SetRule {
        /// Launching package
        source: String,
        /// Launched package
        target: String,
        /// Allow the launch
        #[arg(long)]
        allow: bool,
        /// Deny the launch
        #[arg(long)]
        deny: bool,
    },

    /// Store a package's policy
    SetConfig {
        /// Package name
        package: String,
        /// Freeze policy
        #[arg(long, value_enum, default_value_t = PolicyArg::Smart)]
        policy: PolicyArg,
        /// Freeze mechanism
        #[arg(long, value_enum, default_value_t = FreezeModeArg::Sigstop)]
        freeze_mode: FreezeModeArg,
        /// OOM priority class
        #[arg(long, value_enum, default_value_t = OomPriorityArg::Normal)]
        oom_priority: OomPriorityArg,
        /// Network access
        #[arg(long, value_enum, default_value_t = NetworkArg::FullAccess)]
        network: NetworkArg,
        /// Wake the package for push messages
        #[arg(long)]
        allow_wakeup_for_push: bool,
        /// Allow the package to start on its own
        #[arg(long)]
        allow_autostart: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Exempt,
    Smart,
    StrictBackground,
}

impl From<PolicyArg> for FreezePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Exempt => Self::Exempt,
            PolicyArg::Smart => Self::Smart,
            PolicyArg::StrictBackground => Self::StrictBackground,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FreezeModeArg {
    Sigstop,
    Kill,
    Hibernate,
}

impl From<FreezeModeArg> for FreezeMode {
    fn from(arg: FreezeModeArg) -> Self {
        match arg {
            FreezeModeArg::Sigstop => Self::Sigstop,
            FreezeModeArg::Kill => Self::Kill,
            FreezeModeArg::Hibernate => Self::Hibernate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OomPriorityArg {
    High,
    Normal,
    Low,
}

impl From<OomPriorityArg> for OomPriority {
    fn from(arg: OomPriorityArg) -> Self {
        match arg {
            OomPriorityArg::High => Self::High,
            OomPriorityArg::Normal => Self::Normal,
            OomPriorityArg::Low => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NetworkArg {
    FullAccess,
    WifiOnly,
    Blocked,
}

impl From<NetworkArg> for NetworkPolicy {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::FullAccess => Self::FullAccess,
            NetworkArg::WifiOnly => Self::WifiOnly,
            NetworkArg::Blocked => Self::Blocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReasonArg {
    PushMessage,
    UserInteraction,
    WidgetUpdate,
}

impl From<ReasonArg> for UnfreezeReason {
    fn from(arg: ReasonArg) -> Self {
        match arg {
            ReasonArg::PushMessage => Self::PushMessage,
            ReasonArg::UserInteraction => Self::UserInteraction,
            ReasonArg::WidgetUpdate => Self::WidgetUpdate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventKindArg {
    Foreground,
    Background,
    ScreenOn,
    ScreenOff,
}

impl From<EventKindArg> for EventKind {
    fn from(arg: EventKindArg) -> Self {
        match arg {
            EventKindArg::Foreground => Self::AppForeground,
            EventKindArg::Background => Self::AppBackground,
            EventKindArg::ScreenOn => Self::ScreenOn,
            EventKindArg::ScreenOff => Self::ScreenOff,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let socket = cli.socket.as_path();
    match cli.command {
        Commands::Stats { count } => commands::stats(socket, count),
        Commands::Events { limit } => commands::events(socket, limit),
        Commands::CheckLaunch { source, target } => commands::check_launch(socket, source, target),
        Commands::Unfreeze {
            package,
            duration_ms,
            reason,
        } => commands::unfreeze(socket, package, reason.into(), duration_ms),
        Commands::PushEvent {
            kind,
            source,
            target,
        } => commands::push_event(socket, kind.into(), source, target.unwrap_or_default()),
        Commands::SetRule {
            source,
            target,
            allow,
            deny: _,
        } => commands::set_rule(socket, source, target, allow),
        Commands::SetConfig {
            package,
            policy,
            freeze_mode,
            oom_priority,
            network,
            allow_wakeup_for_push,
            allow_autostart,
        } => commands::set_config(
            socket,
            commands::AppSettings {
                package,
                policy: policy.into(),
                freeze_mode: freeze_mode.into(),
                oom_priority: oom_priority.into(),
                network_policy: network.into(),
                allow_wakeup_for_push,
                allow_autostart,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn stats_count_defaults_to_five() {
        let cli = Cli::try_parse_from(["thanatosctl", "stats"]).unwrap();
        assert!(matches!(cli.command, Commands::Stats { count: 5 }));
        assert_eq!(cli.socket, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn set_rule_requires_exactly_one_decision() {
        let allow =
            Cli::try_parse_from(["thanatosctl", "set-rule", "com.a", "com.b", "--allow"]).unwrap();
        assert!(matches!(allow.command, Commands::SetRule { allow: true, .. }));

        let deny =
            Cli::try_parse_from(["thanatosctl", "set-rule", "com.a", "com.b", "--deny"]).unwrap();
        assert!(matches!(deny.command, Commands::SetRule { allow: false, .. }));

        assert!(Cli::try_parse_from(["thanatosctl", "set-rule", "com.a", "com.b"]).is_err());
        assert!(
            Cli::try_parse_from([
                "thanatosctl",
                "set-rule",
                "com.a",
                "com.b",
                "--allow",
                "--deny"
            ])
            .is_err()
        );
    }

    #[test]
    fn push_event_kinds_map_to_wire_kinds() {
        let cli = Cli::try_parse_from([
            "thanatosctl",
            "--socket",
            "/tmp/t.sock",
            "push-event",
            "screen-off",
            "system",
        ])
        .unwrap();
        match cli.command {
            Commands::PushEvent { kind, target, .. } => {
                assert_eq!(EventKind::from(kind), EventKind::ScreenOff);
                assert!(target.is_none());
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn set_config_value_enums() {
        let cli = Cli::try_parse_from([
            "thanatosctl",
            "set-config",
            "com.chat",
            "--policy",
            "strict-background",
            "--freeze-mode",
            "hibernate",
            "--network",
            "wifi-only",
        ])
        .unwrap();
        match cli.command {
            Commands::SetConfig {
                policy,
                freeze_mode,
                network,
                oom_priority,
                ..
            } => {
                assert_eq!(FreezePolicy::from(policy), FreezePolicy::StrictBackground);
                assert_eq!(FreezeMode::from(freeze_mode), FreezeMode::Hibernate);
                assert_eq!(NetworkPolicy::from(network), NetworkPolicy::WifiOnly);
                assert_eq!(OomPriority::from(oom_priority), OomPriority::Normal);
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
