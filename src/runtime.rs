// runtime.rs
//
// Task plumbing for the cooperative runtime. All long-running work in this
// crate runs as plain futures on a current-thread tokio runtime: a task
// executes until it awaits, so shared state is only ever observed between
// explicit suspension points. The helpers here carry the two crate-wide
// disciplines: cooperative shutdown and the per-task error boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::*;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Shared stop signal. There is no forced cancellation; every task checks
/// the flag at its own suspension points and winds down on its own.
pub struct StopFlag {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `stop()` has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }

    /// Sleep for `d`, waking early on stop. Returns true if the caller
    /// should exit its loop.
    pub async fn sleep_or_stop(&self, d: Duration) -> bool {
        tokio::select! {
            _ = sleep(d) => self.is_stopped(),
            _ = self.wait() => true,
        }
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Error boundary for a long-running task: the error is logged here and
/// the task is not restarted. Whether to reboot on a dead task is the
/// caller's call, not the runtime's.
pub async fn supervise<F>(name: &str, fut: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match fut.await {
        Ok(()) => info!("Task {name} finished."),
        Err(e) => error!("Task {name} failed: {e:#}"),
    }
}


// EOF
