//! Command implementations.
//!
//! Each command opens one connection, runs one call on a current-thread
//! runtime and prints the result.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use thanatos_daemon::protocol::DaemonClient;
use thanatos_daemon::protocol::messages::{
    AppPolicyConfig, EventKind, FrameworkEvent, FreezeMode, FreezePolicy, LaunchRule,
    NetworkPolicy, OomPriority, RuntimeStatsSnapshot, TemporaryUnfreezeRequest, UnfreezeReason,
};

/// Settings for `set-config`.
pub struct AppSettings {
    pub package: String,
    pub policy: FreezePolicy,
    pub freeze_mode: FreezeMode,
    pub oom_priority: OomPriority,
    pub network_policy: NetworkPolicy,
    pub allow_wakeup_for_push: bool,
    pub allow_autostart: bool,
}

fn with_client<T, F, Fut>(socket_path: &Path, call: F) -> Result<T>
where
    F: FnOnce(DaemonClient) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let client = DaemonClient::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        tracing::debug!(server = client.server_info(), "connected");
        call(client).await
    })
}

/// `stats`: prints `count` snapshots, then cancels the stream.
pub fn stats(socket_path: &Path, count: usize) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let mut stream = client
            .stream_runtime_stats()
            .await
            .context("failed to open stats stream")?;

        for _ in 0..count {
            let Some(snapshot) = stream.next().await.context("stats stream failed")? else {
                println!("stream ended by the daemon");
                return Ok(());
            };
            print_snapshot(&snapshot);
        }
        stream.cancel().await.context("failed to cancel stats stream")?;
        Ok(())
    })
}

fn print_snapshot(stats: &RuntimeStatsSnapshot) {
    println!("--------------------------------");
    println!("Received stats at {}:", Local::now().format("%H:%M:%S"));
    println!("  Total memory: {} MB", stats.total_mem_kb / 1024);
    println!("  Avail memory: {} MB", stats.avail_mem_kb / 1024);
    println!("  Frozen apps:  {}", stats.frozen_app_count);
    println!("  CPU usage:    {:.1}%", stats.cpu_usage_percent);
    println!("  Net speed:    {} Kbps", stats.network_speed_bps / 1000);
}

/// `events`: prints the daemon's recent event log.
pub fn events(socket_path: &Path, limit: u32) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let entries = client
            .get_recent_events(limit)
            .await
            .context("failed to fetch recent events")?;

        if entries.is_empty() {
            println!("no events");
        }
        for entry in entries {
            let when = DateTime::from_timestamp_millis(entry.timestamp_ms).map_or_else(
                || entry.timestamp_ms.to_string(),
                |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            );
            let package = if entry.package_name.is_empty() {
                "-"
            } else {
                entry.package_name.as_str()
            };
            println!("{when}  {package:<32}  {}", entry.description);
        }
        Ok(())
    })
}

/// `check-launch`: prints the resolved decision.
pub fn check_launch(socket_path: &Path, source: String, target: String) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let rule = client
            .should_allow_launch(source, target)
            .await
            .context("ShouldAllowLaunch failed")?;
        let verdict = if rule.allowed { "allowed" } else { "denied" };
        println!(
            "{} -> {}: {verdict}",
            rule.source_package, rule.target_package
        );
        Ok(())
    })
}

/// `unfreeze`: opens a temporary unfreeze window.
pub fn unfreeze(
    socket_path: &Path,
    package: String,
    reason: UnfreezeReason,
    duration_ms: u64,
) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let request = TemporaryUnfreezeRequest {
            package_name: package.clone(),
            reason: reason.into(),
            duration_ms,
        };
        client
            .request_temporary_unfreeze(request)
            .await
            .context("RequestTemporaryUnfreeze failed")?;
        println!("Unfreeze of '{package}' requested for {duration_ms} ms");
        Ok(())
    })
}

/// `push-event`: pushes one framework event.
pub fn push_event(
    socket_path: &Path,
    kind: EventKind,
    source: String,
    target: String,
) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let event = FrameworkEvent {
            kind: kind.into(),
            source_package: source,
            target_package: target,
            timestamp_ms: Local::now().timestamp_millis(),
        };
        client
            .push_framework_events([event])
            .await
            .context("PushFrameworkEvents failed")?;
        println!("Pushed {kind:?}");
        Ok(())
    })
}

/// `set-rule`: stores a launch rule.
pub fn set_rule(socket_path: &Path, source: String, target: String, allowed: bool) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let rule = LaunchRule::new(source, target, allowed);
        println!(
            "{} -> {}: {}",
            rule.source_package,
            rule.target_package,
            if allowed { "allow" } else { "deny" }
        );
        client
            .set_launch_rule(rule)
            .await
            .context("SetLaunchRule failed")
    })
}

/// `set-config`: stores a package's policy.
pub fn set_config(socket_path: &Path, settings: AppSettings) -> Result<()> {
    with_client(socket_path, |mut client| async move {
        let package = settings.package.clone();
        let config = AppPolicyConfig {
            package_name: settings.package,
            policy: settings.policy.into(),
            freeze_mode: settings.freeze_mode.into(),
            oom_priority: settings.oom_priority.into(),
            network_policy: settings.network_policy.into(),
            allow_wakeup_for_push: settings.allow_wakeup_for_push,
            allow_autostart: settings.allow_autostart,
        };
        client
            .set_app_config(config)
            .await
            .context("SetAppConfig failed")?;
        println!("Configuration of '{package}' updated");
        Ok(())
    })
}
