use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const FIRST_STEP: Duration = Duration::from_millis(1);
const MAX_STEP: Duration = Duration::from_millis(16);

/// Counting semaphore bounding the connections a pool hands out.
///
/// Only the in-use count is stored, so `in_use + available == max` holds at
/// every observation.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max: usize,
    in_use: AtomicUsize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Take a permit, sleeping in growing steps until `timeout` elapses
    pub fn acquire(&self, timeout: Duration) -> bool {
        if self.try_acquire() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut step = FIRST_STEP;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(step.min(deadline - now));
            if self.try_acquire() {
                return true;
            }
            step = (step * 2).min(MAX_STEP);
        }
    }

    pub fn release(&self) {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("Connection limiter released more permits than it handed out");
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available_count(&self) -> usize {
        self.max - self.in_use_count()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
