use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Coalescing wake-up handle for a worker's event loop.
///
/// Any thread may call [`WorkerWaker::wake`]; the owning worker awaits
/// [`WorkerWaker::awoken`] in its select loop. Wakes that arrive while one
/// is already scheduled collapse into it, so a burst of completions costs
/// the worker at most one extra sweep.
#[derive(Clone)]
pub struct WorkerWaker {
    inner: Arc<WakerInner>,
}

struct WakerInner {
    scheduled: AtomicBool,
    notify: Notify,
}

impl WorkerWaker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WakerInner {
                scheduled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Schedules the worker to run an async-work sweep. Safe to call from
    /// any thread, any number of times; extra calls coalesce.
    pub fn wake(&self) {
        if self
            .inner
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.notify.notify_one();
        }
    }

    /// Waits until at least one wake has been issued, then re-arms.
    ///
    /// Only the owning worker calls this. A wake issued before the call
    /// completes immediately via the stored notify permit.
    pub async fn awoken(&self) {
        self.inner.notify.notified().await;
        self.inner.scheduled.store(false, Ordering::SeqCst);
    }
}

impl Default for WorkerWaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion flag a pending operation raises from any thread.
///
/// [`DataTrigger::signal`] marks data ready and wakes the worker; the
/// worker's sweep consumes the flag with [`DataTrigger::check_reset`] to
/// decide which requests to peek.
pub struct DataTrigger {
    triggered: AtomicBool,
    waker: WorkerWaker,
}

impl DataTrigger {
    pub fn new(waker: WorkerWaker) -> Arc<Self> {
        Arc::new(Self {
            triggered: AtomicBool::new(false),
            waker,
        })
    }

    /// Raises the flag and wakes the owning worker. Repeated calls before
    /// the worker sweeps are absorbed into one.
    pub fn signal(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.waker.wake();
        }
    }

    /// Consumes the flag. Returns `true` if a signal arrived since the
    /// last check.
    pub fn check_reset(&self) -> bool {
        self.triggered
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn burst_of_wakes_coalesces_into_one() {
        let waker = WorkerWaker::new();

        for _ in 0..5 {
            waker.wake();
        }

        // First wait resolves immediately off the stored permit.
        tokio::time::timeout(Duration::from_millis(100), waker.awoken())
            .await
            .unwrap();

        // No second sweep is owed.
        let extra = tokio::time::timeout(Duration::from_millis(50), waker.awoken()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn wake_after_consume_schedules_again() {
        let waker = WorkerWaker::new();

        waker.wake();
        waker.awoken().await;

        waker.wake();
        tokio::time::timeout(Duration::from_millis(100), waker.awoken())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn trigger_signals_once_until_checked() {
        let waker = WorkerWaker::new();
        let trigger = DataTrigger::new(waker.clone());

        trigger.signal();
        trigger.signal();
        trigger.signal();

        waker.awoken().await;
        assert!(trigger.check_reset());
        assert!(!trigger.check_reset());

        trigger.signal();
        assert!(trigger.check_reset());
    }
}
