//! Start/stop plumbing shared by the periodic background loops.
//!
//! A [`TaskSlot`] holds at most one running task. `start` is a no-op while a
//! task is alive, so a loop is never duplicated; `stop` signals the task,
//! then awaits it, so the owner only reports "stopped" once the loop has
//! actually exited.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Receiver half handed to the loop; resolves when the owner calls `stop`.
pub(crate) type ShutdownSignal = oneshot::Receiver<()>;

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

pub(crate) struct TaskSlot {
    name: &'static str,
    running: Mutex<Option<RunningTask>>,
}

impl TaskSlot {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the loop built by `make` unless one is already alive.
    ///
    /// Must be called from within a Tokio runtime. Returns `false` when a
    /// task was already running.
    pub(crate) fn start<F, Fut>(&self, make: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(make(rx));
        *running = Some(RunningTask {
            handle,
            shutdown: tx,
        });
        true
    }

    /// Signal the loop and wait for it to exit. Returns `false` if nothing
    /// was running.
    pub(crate) async fn stop(&self) -> bool {
        let Some(task) = self.running.lock().take() else {
            return false;
        };
        // The loop may already have exited; a closed channel is fine.
        let _ = task.shutdown.send(());
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                error!(task = self.name, "Background task panicked before stop");
            }
        }
        debug!(task = self.name, "Background task stopped");
        true
    }
}

/// Run one iteration of a loop body, turning a panic into a logged error so
/// the surrounding loop keeps going.
pub(crate) async fn run_guarded<Fut>(task: &'static str, body: Fut)
where
    Fut: Future<Output = ()>,
{
    if AssertUnwindSafe(body).catch_unwind().await.is_err() {
        error!(task, "Iteration panicked; continuing on next interval");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ticking_loop(
        ticks: Arc<AtomicUsize>,
    ) -> impl FnOnce(ShutdownSignal) -> futures::future::BoxFuture<'static, ()> {
        move |mut shutdown| {
            Box::pin(async move {
                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {
                            ticks.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_awaits_exit() {
        let slot = TaskSlot::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        assert!(slot.start(ticking_loop(Arc::clone(&ticks))));
        assert!(!slot.start(ticking_loop(Arc::clone(&ticks))));
        assert!(slot.is_running());

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        assert!(slot.stop().await);
        assert!(!slot.is_running());
        assert!(!slot.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn can_restart_after_stop() {
        let slot = TaskSlot::new("restart");
        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(slot.start(ticking_loop(Arc::clone(&ticks))));
        slot.stop().await;
        assert!(slot.start(ticking_loop(Arc::clone(&ticks))));
        assert!(slot.is_running());
        slot.stop().await;
    }

    #[tokio::test]
    async fn run_guarded_swallows_panics() {
        run_guarded("panicky", async { panic!("boom") }).await;
        run_guarded("fine", async {}).await;
    }
}
