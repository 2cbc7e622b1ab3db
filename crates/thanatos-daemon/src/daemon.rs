//! Daemon bootstrap and lifecycle.
//!
//! Threads at runtime:
//!
//! - the caller's thread drives the single-threaded [`EventLoop`] (timers
//!   and the maintenance tick) from [`Daemon::run_until_shutdown`];
//! - `thanatos-rpc` runs the accept loop on a multi-threaded runtime whose
//!   workers serve connections.
//!
//! Shutdown order: stop accepting and cancel in-flight calls, join the RPC
//! thread (which removes the socket), stop the maintenance tick, cancel every
//! pending timer.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tokio::runtime::Builder;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::engine::{DecisionEngine, EngineServices};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::protocol::{ProtocolError, ProtocolServer};
use crate::service::RpcServices;
use crate::services::CoreServices;
use crate::telemetry::SystemTelemetry;
use crate::timer::TimerScheduler;

/// Name of the thread running the accept loop.
pub const RPC_THREAD_NAME: &str = "thanatos-rpc";

/// Name prefix of the RPC worker threads.
pub const RPC_WORKER_THREAD_NAME: &str = "thanatos-rpc-worker";

/// Errors that prevent the daemon from starting or stopping cleanly.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A runtime, thread or signal handler could not be created.
    #[error("daemon I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket could not be bound or cleaned up.
    #[error("RPC server error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The RPC thread panicked.
    #[error("RPC thread panicked")]
    RpcThreadPanicked,
}

/// A running daemon.
pub struct Daemon {
    event_loop: EventLoop,
    scheduler: TimerScheduler,
    engine: Arc<dyn DecisionEngine>,
    telemetry: Arc<SystemTelemetry>,
    maintenance: JoinHandle<()>,
    rpc: RpcThread,
    socket_path: PathBuf,
}

impl Daemon {
    /// Wires the core together and starts serving the socket.
    ///
    /// `make_engine` receives the capability set the core offers to the
    /// engine and returns the engine every RPC and timer is routed to.
    ///
    /// # Errors
    ///
    /// Returns an error if a runtime or thread cannot be created or the
    /// socket cannot be bound.
    pub fn start<F>(config: &DaemonConfig, make_engine: F) -> Result<Self, DaemonError>
    where
        F: FnOnce(Arc<dyn EngineServices>) -> Arc<dyn DecisionEngine>,
    {
        let telemetry = Arc::new(SystemTelemetry::with_proc_root(
            config.telemetry.proc_root.clone(),
        ));
        let scheduler = TimerScheduler::new();
        let core: Arc<dyn EngineServices> = Arc::new(CoreServices::new(
            scheduler.clone(),
            Arc::clone(&telemetry),
        ));
        let engine = make_engine(core);

        let event_loop = EventLoop::new()?;
        scheduler.bind(event_loop.handle(), Arc::downgrade(&engine));
        let maintenance = register_maintenance(
            &event_loop.handle(),
            &engine,
            config.maintenance_interval(),
        );

        let services = RpcServices::new(
            Arc::clone(&engine),
            Arc::clone(&telemetry),
            config.service_config(),
        );
        let server_config = config.server_config();
        let socket_path = server_config.socket_path.clone();
        let rpc = match RpcThread::start(server_config, services) {
            Ok(rpc) => rpc,
            Err(e) => {
                maintenance.abort();
                scheduler.unbind();
                return Err(e);
            },
        };

        info!(
            socket = %socket_path.display(),
            version = env!("CARGO_PKG_VERSION"),
            "thanatosd started"
        );
        Ok(Self {
            event_loop,
            scheduler,
            engine,
            telemetry,
            maintenance,
            rpc,
            socket_path,
        })
    }

    /// Path of the served socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The engine every call is routed to.
    #[must_use]
    pub const fn engine(&self) -> &Arc<dyn DecisionEngine> {
        &self.engine
    }

    /// The timer scheduler offered to the engine.
    #[must_use]
    pub const fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    /// The shared telemetry layer.
    #[must_use]
    pub const fn telemetry(&self) -> &Arc<SystemTelemetry> {
        &self.telemetry
    }

    /// Handle to the event loop.
    #[must_use]
    pub fn event_loop(&self) -> EventLoopHandle {
        self.event_loop.handle()
    }

    /// Drives the event loop on the calling thread until SIGINT or SIGTERM,
    /// then shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed (after
    /// shutting down anyway) or shutdown fails.
    pub fn run_until_shutdown(self) -> Result<(), DaemonError> {
        let signals = self.event_loop.run_until(wait_for_signal());
        let stopped = self.shutdown();
        signals?;
        stopped
    }

    /// Drives the event loop on the calling thread until `stop` completes,
    /// then shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails.
    pub fn run_until<F: Future<Output = ()>>(self, stop: F) -> Result<(), DaemonError> {
        self.event_loop.run_until(stop);
        self.shutdown()
    }

    /// Stops serving and cancels all timers.
    ///
    /// # Errors
    ///
    /// Returns an error if the RPC thread failed or panicked.
    pub fn shutdown(mut self) -> Result<(), DaemonError> {
        info!("thanatosd shutting down");
        let rpc = self.rpc.stop();
        self.maintenance.abort();
        let cancelled = self.scheduler.unbind();
        info!(cancelled_timers = cancelled, "thanatosd stopped");
        rpc
    }
}

fn register_maintenance(
    event_loop: &EventLoopHandle,
    engine: &Arc<dyn DecisionEngine>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    let engine = Arc::downgrade(engine);
    event_loop.spawn_recurring("maintenance", period, move || {
        if let Some(engine) = engine.upgrade() {
            engine.perform_maintenance();
        }
    })
}

async fn wait_for_signal() -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// The accept loop on its own thread and runtime.
struct RpcThread {
    shutdown: CancellationToken,
    thread: Option<thread::JoinHandle<Result<(), ProtocolError>>>,
}

impl RpcThread {
    fn start(
        config: crate::protocol::ServerConfig,
        services: RpcServices,
    ) -> Result<Self, DaemonError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name(RPC_WORKER_THREAD_NAME)
            .build()?;
        let server = {
            let _guard = runtime.enter();
            ProtocolServer::bind(config, services)?
        };

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let thread = thread::Builder::new()
            .name(RPC_THREAD_NAME.to_string())
            .spawn(move || {
                let result = runtime.block_on(server.run(token));
                if let Err(e) = &result {
                    error!(error = %e, "RPC server stopped with an error");
                }
                result
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) -> Result<(), DaemonError> {
        self.shutdown.cancel();
        match self.thread.take().map(thread::JoinHandle::join) {
            None => Ok(()),
            Some(Ok(result)) => result.map_err(DaemonError::from),
            Some(Err(_)) => Err(DaemonError::RpcThreadPanicked),
        }
    }
}

impl Drop for RpcThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "RPC thread did not stop cleanly");
        }
    }
}
