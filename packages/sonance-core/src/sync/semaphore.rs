//! Counting semaphore built on a mutex + condvar pair.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
///
/// Used for one-shot completion signalling: the completing side calls
/// [`post`](Self::post), the waiting side blocks in [`wait`](Self::wait).
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Increments the counter and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Blocks until the counter is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_before_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || {
            sem2.wait();
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        assert!(handle.join().unwrap());
    }
}
