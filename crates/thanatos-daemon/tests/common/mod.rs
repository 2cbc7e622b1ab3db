//! Daemon fixture for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thanatos_daemon::{
    Daemon, DaemonConfig, DaemonError, DecisionEngine, MemoryEngine, TimerScheduler,
};
use tokio::sync::oneshot;

pub const MEMINFO: &str = "MemTotal:        8000000 kB\n\
                           MemFree:          200000 kB\n\
                           MemAvailable:    3500000 kB\n\
                           Buffers:           10000 kB\n";

pub const STAT: &str = "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0 0 0\n";

/// A daemon serving a socket in a temporary directory, with its event loop
/// driven on a background thread.
pub struct TestDaemon {
    pub socket: PathBuf,
    pub engine: Arc<MemoryEngine>,
    pub scheduler: TimerScheduler,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<Result<(), DaemonError>>>,
    _dir: TempDir,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(configure: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        fs::create_dir(&proc_root).unwrap();
        fs::write(proc_root.join("meminfo"), MEMINFO).unwrap();
        fs::write(proc_root.join("stat"), STAT).unwrap();

        let mut config = DaemonConfig::default();
        config.server.socket_path = dir.path().join("run").join("thanatosd.sock");
        config.telemetry.proc_root = proc_root;
        configure(&mut config);
        config.validate().unwrap();

        let mut created = None;
        let engine_config = config.engine_config();
        let daemon = Daemon::start(&config, |services| {
            let engine = Arc::new(MemoryEngine::new(engine_config, services));
            created = Some(Arc::clone(&engine));
            let engine: Arc<dyn DecisionEngine> = engine;
            engine
        })
        .unwrap();

        let socket = daemon.socket_path().to_path_buf();
        let scheduler = daemon.scheduler().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread = thread::spawn(move || {
            daemon.run_until(async {
                let _ = stop_rx.await;
            })
        });

        Self {
            socket,
            engine: created.unwrap(),
            scheduler,
            stop: Some(stop_tx),
            thread: Some(thread),
            _dir: dir,
        }
    }

    /// Stops the daemon and returns its shutdown result.
    pub fn stop(mut self) -> Result<(), DaemonError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), DaemonError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

/// Polls `condition` every 5 ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
