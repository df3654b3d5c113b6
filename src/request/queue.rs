use super::future::ResponseFuture;
use super::{AsyncRequest, PendingRequest};
use crate::config::MAX_ASYNC_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{Command, Expectation, RespValue};
use crate::runtime::ticker::Ticker;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How often queued requests are checked for expiry
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one queued command. Implemented by the pool.
pub trait Dispatcher: Send + Sync {
    /// Acquire a connection within `wait` and perform the round trip.
    /// `Ok(None)` means the command was sent without reading a reply.
    fn dispatch(&self, command: &Command, wait: Duration) -> Result<Option<RespValue>>;
}

#[derive(Default)]
struct RequestQueue {
    items: Mutex<VecDeque<Box<dyn PendingRequest>>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl RequestQueue {
    /// Next request, or `None` once closed
    fn pop(&self) -> Option<Box<dyn PendingRequest>> {
        let mut items = self.items.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(request) = items.pop_front() {
                return Some(request);
            }
            self.ready.wait(&mut items);
        }
    }

    fn take_expired(&self, now: Instant) -> Vec<Box<dyn PendingRequest>> {
        let mut items = self.items.lock();
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(items.len());
        for request in items.drain(..) {
            if request.is_expired(now) || request.state().is_terminal() {
                expired.push(request);
            } else {
                keep.push_back(request);
            }
        }
        *items = keep;
        expired
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorStats {
    pub queued: usize,
    pub dispatched: u64,
    pub expired: u64,
}

/// Overflow path for requests that could not get a connection right away.
///
/// A single worker drains the queue in order. Each request gets a timed
/// acquire bounded by what is left of its lifetime. A sweep fails requests
/// whose lifetime ran out while they were still queued.
pub struct AsyncProcessor {
    queue: Arc<RequestQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    expiry: Ticker,
    default_timeout: Duration,
    dispatched: Arc<AtomicU64>,
    expired: Arc<AtomicU64>,
}

impl AsyncProcessor {
    pub fn start(dispatcher: Weak<dyn Dispatcher>, default_timeout: Duration) -> Result<Self> {
        let queue = Arc::new(RequestQueue::default());
        let dispatched = Arc::new(AtomicU64::new(0));
        let expired = Arc::new(AtomicU64::new(0));

        let worker_queue = Arc::clone(&queue);
        let worker_dispatched = Arc::clone(&dispatched);
        let worker = thread::Builder::new()
            .name("feox-async".to_string())
            .spawn(move || run_worker(&worker_queue, &dispatcher, &worker_dispatched))?;

        let expiry = Ticker::new("async-expiry", EXPIRY_SWEEP_INTERVAL);
        let sweep_queue = Arc::clone(&queue);
        let sweep_expired = Arc::clone(&expired);
        expiry.start(move || {
            let n = sweep(&sweep_queue, Instant::now());
            if n > 0 {
                sweep_expired.fetch_add(n as u64, Ordering::Relaxed);
            }
        });

        debug!("Async processor started");
        Ok(Self {
            queue,
            worker: Mutex::new(Some(worker)),
            expiry,
            default_timeout: default_timeout.min(MAX_ASYNC_TIMEOUT),
            dispatched,
            expired,
        })
    }

    /// Queue `command` with the default lifetime
    pub fn enqueue<E: Expectation>(&self, command: Command) -> Result<ResponseFuture<E::Output>> {
        self.enqueue_with_timeout::<E>(command, self.default_timeout)
    }

    pub fn enqueue_with_timeout<E: Expectation>(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<ResponseFuture<E::Output>> {
        command.validate()?;
        let (request, future) = AsyncRequest::<E>::new(command, timeout.min(MAX_ASYNC_TIMEOUT));
        self.push(Box::new(request))?;
        Ok(future)
    }

    fn push(&self, request: Box<dyn PendingRequest>) -> Result<()> {
        let mut items = self.queue.items.lock();
        if self.queue.closed.load(Ordering::Acquire) {
            return Err(Error::ObjectDisposed("async processor"));
        }
        trace!("Queued {}", request.command());
        items.push_back(request);
        self.queue.ready.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            queued: self.len(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and fail everything still queued with `ObjectDisposed`
    pub fn stop(&self) {
        let leftover: Vec<_> = {
            let mut items = self.queue.items.lock();
            if self.queue.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.queue.ready.notify_all();
            items.drain(..).collect()
        };

        self.expiry.stop();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }

        if !leftover.is_empty() {
            debug!("Failing {} queued requests on shutdown", leftover.len());
        }
        for request in leftover {
            request.fail(Error::ObjectDisposed("async processor"));
        }
    }
}

impl Drop for AsyncProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(queue: &RequestQueue, dispatcher: &Weak<dyn Dispatcher>, dispatched: &AtomicU64) {
    while let Some(request) = queue.pop() {
        if !request.initiate() {
            // Canceled or expired while queued
            continue;
        }

        let remaining = request.remaining(Instant::now());
        if remaining.is_zero() {
            request.fail(expired_error(request.as_ref()));
            continue;
        }

        let outcome = match dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.dispatch(request.command(), remaining),
            None => Err(Error::ObjectDisposed("connection pool")),
        };
        dispatched.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Some(reply)) => {
                request.complete_with(reply);
            }
            Ok(None) => {
                request.complete_unread();
            }
            Err(e) => {
                if !e.is_timeout() {
                    warn!("Queued {} failed: {}", request.command(), e);
                }
                request.fail(e);
            }
        }
    }
    debug!("Async processor worker exiting");
}

fn sweep(queue: &RequestQueue, now: Instant) -> usize {
    let expired = queue.take_expired(now);
    let mut failed = 0;
    for request in expired {
        if request.fail(expired_error(request.as_ref())) {
            failed += 1;
        }
    }
    if failed > 0 {
        debug!("Expired {} queued requests", failed);
    }
    failed
}

fn expired_error(request: &dyn PendingRequest) -> Error {
    Error::timeout(format!(
        "{} expired after {:?} in the async queue",
        request.command(),
        request.timeout()
    ))
}
