//! Single-threaded event loop hosting timers and maintenance ticks.
//!
//! The loop is a current-thread tokio runtime. It is driven either by the
//! thread that owns it ([`EventLoop::run_until`], used by the daemon's main
//! thread) or by a dedicated thread ([`EventLoop::start_thread`]). Other
//! threads reach it through a cloneable [`EventLoopHandle`]; everything
//! spawned through a handle runs on the loop thread.

use std::future::Future;
use std::io;
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info};

/// Name of the dedicated event-loop thread.
pub const EVENT_LOOP_THREAD_NAME: &str = "thanatos-event-loop";

/// Owner of the event-loop runtime.
#[derive(Debug)]
pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    /// Builds a current-thread runtime with I/O and time drivers enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime })
    }

    /// Returns a handle for spawning onto this loop from any thread.
    #[must_use]
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            inner: self.runtime.handle().clone(),
        }
    }

    /// Drives the loop on the calling thread until `future` completes.
    ///
    /// Spawned tasks (timers, ticks) only make progress while some thread is
    /// inside this call.
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Starts a loop on a dedicated thread named [`EVENT_LOOP_THREAD_NAME`].
    ///
    /// The loop runs until the returned guard is shut down or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the thread cannot be created.
    pub fn start_thread() -> io::Result<EventLoopThread> {
        let event_loop = Self::new()?;
        let handle = event_loop.handle();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(EVENT_LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                debug!("event loop thread started");
                // Resolves on an explicit stop or when the sender is dropped.
                let _ = event_loop.run_until(stop_rx);
                debug!("event loop thread stopping");
            })?;

        Ok(EventLoopThread {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    inner: Handle,
}

impl EventLoopHandle {
    /// Spawns `future` onto the loop. Never runs it inline.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn(future)
    }

    /// Calls `tick` on the loop every `period`, starting one period from now.
    ///
    /// Missed ticks are delayed rather than replayed in a burst.
    pub fn spawn_recurring<F>(
        &self,
        name: &'static str,
        period: Duration,
        mut tick: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        info!(
            task = name,
            period_ms = period.as_millis(),
            "registering recurring task"
        );
        self.inner.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(task = name, "recurring task tick");
                tick();
            }
        })
    }
}

/// Guard for a loop running on its own thread.
#[derive(Debug)]
pub struct EventLoopThread {
    handle: EventLoopHandle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Returns the loop's handle.
    #[must_use]
    pub const fn handle(&self) -> &EventLoopHandle {
        &self.handle
    }

    /// Stops the loop and joins its thread. Pending tasks are dropped.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn spawned_work_runs_on_loop_thread() {
        let event_loop = EventLoop::start_thread().unwrap();
        let (tx, rx) = mpsc::channel();

        event_loop.handle().spawn(async move {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(EVENT_LOOP_THREAD_NAME));
        event_loop.shutdown();
    }

    #[test]
    fn run_until_drives_spawned_tasks() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let (tx, rx) = oneshot::channel();

        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(thread::current().id());
        });

        let ran_on = event_loop.run_until(rx).unwrap();
        assert_eq!(ran_on, thread::current().id());
    }

    #[test]
    fn recurring_task_ticks_until_loop_stops() {
        let event_loop = EventLoop::start_thread().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        event_loop
            .handle()
            .spawn_recurring("test", Duration::from_millis(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        thread::sleep(Duration::from_millis(200));
        event_loop.shutdown();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "only {after_stop} ticks");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }
}
