use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::{TaskTracker, task_tracker::TaskTrackerToken},
};

/// Winds down the background loops of one runtime component.
///
/// Pairs a cancellation token with a task tracker: `stop` asks every loop to
/// finish, [`all_stopped`] resolves once the last one has. A loop registers
/// itself with [`start_task`] and selects on [`TaskGuard::stopped`]; the
/// guard reports completion to the tracker when it drops.
///
/// [`all_stopped`]: TaskSupervisor::all_stopped
/// [`start_task`]: TaskSupervisor::start_task
#[derive(Debug)]
pub struct TaskSupervisor {
    stop: CancellationToken,
    tracker: TaskTracker,
}

/// Membership handle for one supervised loop.
#[derive(Debug)]
pub struct TaskGuard {
    stop: CancellationToken,
    _tracked: TaskTrackerToken,
}

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        Self {
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
        self.tracker.close();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        TaskGuard {
            stop: self.stop.clone(),
            _tracked: self.tracker.token(),
        }
    }

    /// Resolves when every registered guard has dropped. Only meaningful
    /// after a stop request; loops keep running until asked to finish.
    pub async fn all_stopped(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    /// Resolves when the owning supervisor requests a stop.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }
}

#[derive(Debug, Default)]
struct InflightState {
    count: AtomicU64,
    zero: tokio::sync::Notify,
}

/// Counts calls currently executing, for graceful drains.
///
/// Unlike [`TaskSupervisor`] the count may return to zero and rise again;
/// [`Inflight::drain`] only observes the instant it is awaited.
#[derive(Debug, Default, Clone)]
pub struct Inflight(Arc<InflightState>);

/// RAII handle for one in-flight call.
#[derive(Debug)]
pub struct InflightGuard(Arc<InflightState>);

impl Inflight {
    #[must_use]
    pub fn track(&self) -> InflightGuard {
        self.0.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard(self.0.clone())
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.count.load(Ordering::Acquire)
    }

    /// Waits until the count reaches zero, up to `timeout`.
    ///
    /// Returns `true` when fully drained, `false` when calls were still
    /// running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register before checking so a concurrent drop cannot be missed.
            let notified = self.0.zero.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return self.count() == 0;
                }
            }
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let remaining = self.0.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.0.zero.notify_waiters();
        }
    }
}
