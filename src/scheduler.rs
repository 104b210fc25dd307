//! Background scheduling primitive.
//!
//! `PeriodicRunner` is the one piece of "run this every so often" plumbing
//! this crate owns: a thread that invokes a closure on an interval, woken
//! early by an explicit call or interrupted by `stop`. Deciding what to run
//! on it — writeback syncing, inode DB snapshotting — and at what interval
//! is left to the embedder; this module only provides the primitive.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct Inner {
    stopped: Mutex<bool>,
    wake: Condvar,
}

pub struct PeriodicRunner {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicRunner {
    pub fn start(interval: Duration, mut task: impl FnMut() + Send + 'static) -> Self {
        let inner = Arc::new(Inner {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_inner = inner.clone();
        let handle = std::thread::spawn(move || loop {
            let guard = worker_inner.stopped.lock().unwrap();
            let (guard, timeout) = worker_inner.wake.wait_timeout(guard, interval).unwrap();
            let stopped = *guard;
            drop(guard);
            if stopped {
                return;
            }
            if timeout.timed_out() {
                task();
            } else {
                // Woken explicitly without being stopped: run once now.
                task();
            }
        });

        PeriodicRunner {
            inner,
            handle: Some(handle),
        }
    }

    /// Wake the runner immediately, causing it to run its task now rather
    /// than waiting out the remainder of the interval.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop the runner and join its thread.
    pub fn stop(mut self) {
        *self.inner.stopped.lock().unwrap() = true;
        self.inner.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            *self.inner.stopped.lock().unwrap() = true;
            self.inner.wake.notify_one();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn wake_triggers_immediate_run() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        let runner = PeriodicRunner::start(Duration::from_secs(3600), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        runner.wake();
        std::thread::sleep(Duration::from_millis(100));
        assert!(counter.load(Ordering::SeqCst) >= 1);
        runner.stop();
    }
}
