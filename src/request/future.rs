use super::state::{AtomicRequestState, RequestState};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Slot<T> {
    state: AtomicRequestState,
    outcome: Mutex<Option<Result<T>>>,
    ready: Condvar,
    created_at: Instant,
}

impl<T> Slot<T> {
    fn settle(&self, target: RequestState, outcome: Result<T>) -> bool {
        if !self.state.finish(target) {
            return false;
        }
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
        true
    }
}

/// Producer side of a request's result
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Completion<T> {
    pub fn new() -> (Completion<T>, ResponseFuture<T>) {
        let slot = Arc::new(Slot {
            state: AtomicRequestState::new(),
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            created_at: Instant::now(),
        });
        (
            Completion {
                slot: Arc::clone(&slot),
            },
            ResponseFuture { slot },
        )
    }

    pub fn initiate(&self) -> bool {
        self.slot.state.initiate()
    }

    pub fn complete(&self, value: T) -> bool {
        self.slot.settle(RequestState::Completed, Ok(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.slot.settle(RequestState::Failed, Err(error))
    }

    pub fn cancel(&self) -> bool {
        self.slot.settle(RequestState::Canceled, Err(Error::Canceled))
    }

    pub fn state(&self) -> RequestState {
        self.slot.state.load()
    }

    pub fn created_at(&self) -> Instant {
        self.slot.created_at
    }
}

/// Consumer side: blocks until the request reaches a terminal state
pub struct ResponseFuture<T> {
    slot: Arc<Slot<T>>,
}

impl<T> ResponseFuture<T> {
    pub fn state(&self) -> RequestState {
        self.slot.state.load()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Wait up to `timeout` for the result. Returns whether it is ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            if self.slot.ready.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.is_some();
            }
        }
        true
    }

    /// Take the result if it has arrived
    pub fn try_take(&self) -> Option<Result<T>> {
        self.slot.outcome.lock().take()
    }

    /// Block until the result arrives
    pub fn wait(self) -> Result<T> {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            self.slot.ready.wait(&mut outcome);
        }
    }

    /// Block up to `timeout`; an elapsed wait is a timeout error and the
    /// request is canceled
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        if self.wait_ready(timeout) {
            return self.wait();
        }
        if self.cancel() {
            return Err(Error::timeout(format!(
                "no result within {:?}",
                timeout
            )));
        }
        // Settled between the wait and the cancel
        self.wait()
    }

    /// Cancel the request unless it already finished
    pub fn cancel(&self) -> bool {
        self.slot.settle(RequestState::Canceled, Err(Error::Canceled))
    }

    pub fn age(&self) -> Duration {
        self.slot.created_at.elapsed()
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("state", &self.state())
            .field("age", &self.age())
            .finish()
    }
}
