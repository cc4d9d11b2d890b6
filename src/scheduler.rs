use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::controller::SyncInner;
use crate::error::SyncError;

/// One refresh cycle of a controller, in a form a [Scheduler] can run as often as it likes.
#[derive(Clone)]
pub struct RefreshTask {
    inner: Arc<SyncInner>,
}

impl RefreshTask {
    pub(crate) fn new(inner: Arc<SyncInner>) -> Self {
        RefreshTask { inner }
    }

    /// Runs one refresh cycle. Failures have already been reported to the controller's listener
    /// by the time this returns, so they are only logged here.
    pub async fn run(&self) {
        match self.inner.refresh_cycle().await {
            Ok(outcome) => debug!("refresh cycle finished: {:?}", outcome),
            Err(SyncError::ShutDown(_)) => debug!("client is shut down, not refreshing"),
            Err(err) => warn!("refresh cycle failed: {}", err),
        }
    }
}

/// Runs refresh tasks in the background.
///
/// Implementations must not run two cycles of one task at the same time; controllers guard
/// against it as well, but an overlapping cycle would only queue up behind the running one.
pub trait Scheduler: Send + Sync {
    /// Runs `task` after `initial_delay` and then every `interval` until shut down.
    fn set_interval(&self, task: RefreshTask, initial_delay: Duration, interval: Duration);

    /// Runs `task` once, as soon as possible.
    fn schedule_once(&self, task: RefreshTask);

    /// Stops starting new runs. A run in progress is left to finish.
    fn shutdown(&self);
}

/// Schedules tasks on the tokio runtime that was current when the scheduler was created.
pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        TokioScheduler {
            runtime: tokio::runtime::Handle::current(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Scheduler for TokioScheduler {
    fn set_interval(&self, task: RefreshTask, initial_delay: Duration, interval: Duration) {
        if self.is_shut_down() {
            return;
        }
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = self.runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + initial_delay, interval);
            // A slow cycle pushes the next one back instead of causing a burst.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task.run().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.handles.lock().push(handle);
    }

    fn schedule_once(&self, task: RefreshTask) {
        if self.is_shut_down() {
            return;
        }
        let handle = self.runtime.spawn(async move { task.run().await });
        self.handles.lock().push(handle);
    }

    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.handles.lock().retain(|handle| !handle.is_finished());
    }
}
