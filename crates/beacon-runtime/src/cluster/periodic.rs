use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Failure of a single periodic invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    /// Logged; the job keeps running.
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// Logged; the job terminates.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type TickFuture = Pin<Box<dyn Future<Output = Result<(), TickError>> + Send>>;

/// A callback invoked on a fixed interval on its own task.
///
/// The first invocation happens one interval after start. `trigger_now`
/// requests an extra invocation without shifting the regular schedule.
pub struct PeriodicJob {
    name: String,
    trigger: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<Result<(), TickError>>>>,
}

impl PeriodicJob {
    /// Spawn the job on the current tokio runtime.
    pub fn start<F>(interval: Duration, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> TickFuture + Send + Sync + 'static,
    {
        let name = name.into();
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));

        let handle = tokio::spawn(run_loop(
            name.clone(),
            interval,
            callback,
            trigger.clone(),
            shutdown_rx,
            running.clone(),
        ));

        Self {
            name,
            trigger,
            shutdown_tx,
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the callback as soon as possible.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    /// Stop the job and wait for an in-flight invocation to finish.
    ///
    /// Returns the fatal error if the job had already terminated on one.
    pub async fn stop(&self) -> Result<(), TickError> {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        let result = match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(TickError::Fatal(format!("periodic job panicked: {}", e))),
            },
            None => Ok(()),
        };
        self.running.store(false, Ordering::SeqCst);
        result
    }
}

impl Drop for PeriodicJob {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_loop<F>(
    name: String,
    interval: Duration,
    callback: F,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) -> Result<(), TickError>
where
    F: Fn() -> TickFuture + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(job = %name, "Periodic job started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
            _ = shutdown_rx.changed() => {}
        }

        if *shutdown_rx.borrow() {
            break;
        }

        match callback().await {
            Ok(()) => {}
            Err(TickError::Recoverable(e)) => {
                tracing::warn!(job = %name, "Periodic job run failed: {}", e);
            }
            Err(TickError::Fatal(e)) => {
                tracing::error!(job = %name, "Periodic job terminated: {}", e);
                running.store(false, Ordering::SeqCst);
                return Err(TickError::Fatal(e));
            }
        }
    }

    tracing::debug!(job = %name, "Periodic job stopped");
    running.store(false, Ordering::SeqCst);
    Ok(())
}
