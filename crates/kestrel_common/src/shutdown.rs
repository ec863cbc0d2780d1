//! Interruptible shutdown signal for background maintenance threads.
//!
//! Replaces bare `thread::sleep` loops with condvar-backed waits that respond
//! to stop signals within milliseconds instead of waiting for the full sleep
//! interval to elapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cooperative shutdown signal. When `shutdown()` is called, any thread
/// blocked in `wait_timeout()` wakes immediately.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`. Returns
    /// `true` if shutdown was requested (caller should exit its loop).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = signal2.wait_timeout(Duration::from_secs(30));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        signal.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_returns_false_without_shutdown() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.is_shutdown());
    }
}
