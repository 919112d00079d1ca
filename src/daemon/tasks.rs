//! Cooperative periodic-task scheduler.
//!
//! Each task awaits either its next tick or the shared stop token.  A
//! task body that errors is logged and the next tick still fires.
//! Shutdown waits up to the grace window for tasks to observe the stop
//! token, then hard-cancels the stragglers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default grace window before hard cancellation.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// A named `(interval, body)` pair.  Blocking store calls are allowed in
/// the body; cancellation is only observed between ticks.
#[derive(Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub interval: Duration,
    pub body: Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
}

impl PeriodicTask {
    pub fn new(
        name: &str,
        interval: Duration,
        body: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            interval,
            body: Arc::new(body),
        }
    }
}

/// Drives a set of periodic tasks against one stop token.
pub struct TaskScheduler {
    stop: CancellationToken,
    grace: Duration,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskScheduler {
    pub fn new(stop: CancellationToken, grace: Duration) -> Self {
        Self {
            stop,
            grace,
            handles: Vec::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Start a task loop.  The first tick fires one full interval after
    /// the spawn, not immediately.
    pub fn spawn(&mut self, task: PeriodicTask) {
        let stop = self.stop.clone();
        let name = task.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval's first tick completes immediately; consume it so
            // the body first runs after one full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(task = %task.name, "periodic task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = (task.body)() {
                            warn!(task = %task.name, error = %e, "periodic task body failed");
                        }
                    }
                }
            }
        });
        debug!(task = %name, "periodic task started");
        self.handles.push((name, handle));
    }

    /// Signal stop and wait for the loops, hard-cancelling any that
    /// outlive the grace window.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let deadline = tokio::time::Instant::now() + self.grace;
        for (name, mut handle) in self.handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => debug!(task = %name, "periodic task stopped"),
                Err(_) => {
                    handle.abort();
                    warn!(task = %name, "periodic task exceeded grace window; aborted");
                }
            }
        }
    }
}
