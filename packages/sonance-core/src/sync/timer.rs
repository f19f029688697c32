//! Wakeup timer with a concurrently updatable deadline.
//!
//! The control task queue thread sleeps in [`Timer::wait_deadline`]; any
//! other thread may move the deadline with [`Timer::try_set_deadline`]
//! without blocking for more than an uncontended lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::time;

/// Deadline value meaning "sleep until explicitly woken".
pub const DEADLINE_INFINITE: i64 = -1;
/// Deadline value meaning "wake up immediately".
pub const DEADLINE_NOW: i64 = 0;

/// Single-waiter timer with an atomically replaceable absolute deadline.
pub struct Timer {
    /// Absolute monotonic deadline in ns; 0 = now, -1 = infinite.
    deadline: AtomicI64,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            deadline: AtomicI64::new(DEADLINE_INFINITE),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Replaces the deadline and wakes the waiter if it is sleeping.
    pub fn try_set_deadline(&self, deadline: i64) {
        self.deadline.store(deadline, Ordering::SeqCst);
        // the empty critical section orders this update with the waiter's
        // check-then-sleep so the notification can't be lost
        drop(self.mutex.lock());
        self.cond.notify_all();
    }

    /// Blocks the calling thread until the current deadline expires or is
    /// replaced with an already-expired one.
    pub fn wait_deadline(&self) {
        let mut guard = self.mutex.lock();
        loop {
            let deadline = self.deadline.load(Ordering::SeqCst);
            if deadline == DEADLINE_NOW {
                return;
            }
            if deadline > 0 {
                let now = time::monotonic_ns();
                if now >= deadline {
                    return;
                }
                let _ = self
                    .cond
                    .wait_for(&mut guard, Duration::from_nanos((deadline - now) as u64));
            } else {
                self.cond.wait(&mut guard);
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_deadline_returns_immediately() {
        let timer = Timer::new();
        timer.try_set_deadline(DEADLINE_NOW);
        timer.wait_deadline();
    }

    #[test]
    fn expired_absolute_deadline_returns() {
        let timer = Timer::new();
        timer.try_set_deadline(time::monotonic_ns() - 1);
        timer.wait_deadline();
    }

    #[test]
    fn wakes_when_deadline_replaced() {
        let timer = Arc::new(Timer::new());
        timer.try_set_deadline(DEADLINE_INFINITE);

        let timer2 = Arc::clone(&timer);
        let waiter = std::thread::spawn(move || {
            timer2.wait_deadline();
        });

        std::thread::sleep(Duration::from_millis(20));
        timer.try_set_deadline(DEADLINE_NOW);
        waiter.join().unwrap();
    }

    #[test]
    fn waits_until_future_deadline() {
        let timer = Timer::new();
        let start = time::monotonic_ns();
        timer.try_set_deadline(start + 20 * time::MILLISECOND);
        timer.wait_deadline();
        assert!(time::monotonic_ns() - start >= 15 * time::MILLISECOND);
    }
}
