//! Auto-reset wakeup signal for worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// An auto-reset binary signal.
///
/// `signal()` marks the signal ready and wakes one waiter; `wait()` blocks
/// until ready and consumes the readiness, so each `signal()` releases at
/// most one `wait()`. A `signal()` delivered while nobody is waiting is
/// remembered until the next `wait()`, which makes the
/// publish-availability-then-block handshake of the dispatcher race-free:
/// a wake posted between those two steps is not lost.
#[derive(Debug, Default)]
pub struct WakeSignal {
    ready: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl WakeSignal {
    /// Create a new, unsignaled instance.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    /// Mark the signal ready and wake a waiter.
    pub fn signal(&self) {
        // Hold the lock while setting ready to avoid lost wakeup race condition
        let _guard = self.mutex.lock();
        self.ready.store(true, Ordering::Release);
        self.condvar.notify_one();
    }

    /// Block until signaled, consuming the readiness.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !self.ready.swap(false, Ordering::AcqRel) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until signaled or the timeout elapses.
    ///
    /// Returns `true` if the signal was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        loop {
            if self.ready.swap(false, Ordering::AcqRel) {
                return true;
            }
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return self.ready.swap(false, Ordering::AcqRel);
            }
        }
    }
}
