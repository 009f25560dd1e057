//! Execution contexts: the worker pool and the UI loop
//!
//! The worker pool is the multi-threaded tokio runtime, reached
//! through [`WorkerHandle`]. The UI loop is one dedicated OS thread
//! draining closures in FIFO order; [`UiHandle`] is the only primitive
//! that crosses into it. Nothing here knows about widgets - the panel
//! toolkit lives entirely behind the closures plugins submit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

pub use ledge_plugin_api::{UiHandle, UiTask, WorkerHandle};

/// The single-threaded cooperative context for interface mutations.
///
/// Tasks run in submission order. A panicking task is caught and
/// logged; it never takes the loop down with it.
pub struct UiLoop {
    handle: UiHandle,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl UiLoop {
    /// Start the UI thread and return the loop plus a submission
    /// handle.
    pub fn spawn() -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<UiTask>();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("ledge-ui".to_string())
                .spawn(move || {
                    debug!("UI loop started");
                    loop {
                        match rx.blocking_recv() {
                            Some(task) => run_task(task),
                            None => break,
                        }
                        // The stop flag is observed only after a task
                        // ran: everything queued before the stop wake
                        // sits ahead of it in the channel, so drain
                        // the backlog before exiting.
                        if stop.load(Ordering::Acquire) {
                            while let Ok(task) = rx.try_recv() {
                                run_task(task);
                            }
                            break;
                        }
                    }
                    debug!("UI loop stopped");
                })
                .expect("failed to spawn UI thread")
        };

        Self {
            handle: UiHandle::new(tx),
            stop,
            thread: Some(thread),
        }
    }

    /// A cloneable handle for submitting work to the UI thread.
    pub fn handle(&self) -> UiHandle {
        self.handle.clone()
    }

    /// Stop the loop after the tasks already queued have run, and wait
    /// for the thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        // Wake the loop in case it is parked on an empty channel.
        self.handle.dispatch(|| {});
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_task(task: UiTask) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(task));
    if result.is_err() {
        warn!("UI task panicked; loop continues");
    }
}

impl Drop for UiLoop {
    fn drop(&mut self) {
        // Signal without joining; stop() is the orderly path.
        self.stop.store(true, Ordering::Release);
        self.handle.dispatch(|| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_ui_loop_runs_tasks_in_order() {
        let ui = UiLoop::spawn();
        let handle = ui.handle();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            handle.dispatch(move || seen.lock().unwrap().push(i));
        }
        ui.stop();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_drains_tasks_queued_before_it() {
        let ui = UiLoop::spawn();
        let handle = ui.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        // Hold the thread on the first task so stop() is signalled
        // while the rest are still queued.
        handle.dispatch(|| std::thread::sleep(Duration::from_millis(50)));
        for _ in 0..10 {
            let ran = ran.clone();
            handle.dispatch(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        ui.stop();

        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_ui_loop_survives_panicking_task() {
        let ui = UiLoop::spawn();
        let handle = ui.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        handle.dispatch(|| panic!("widget exploded"));
        {
            let ran = ran.clone();
            handle.dispatch(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        ui.stop();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_to_ui_handoff() {
        let ui = UiLoop::spawn();
        let handle = ui.handle();
        let workers = WorkerHandle::current();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        workers
            .spawn(async move {
                // Worker-side computation, then an explicit hand-off.
                let value = 6 * 7;
                handle.dispatch(move || {
                    let _ = done_tx.send(value);
                });
            })
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
        ui.stop();
    }
}
