use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool shared by pulses, async completions and
/// pub/sub callback dispatch.
///
/// A panicking job is logged and contained; the worker keeps running.
pub struct Executor {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    threads: usize,
}

impl Executor {
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("feox-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, rx, pending))?;
            workers.push(handle);
        }

        debug!("Executor started with {} workers", threads);
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
            threads,
        })
    }

    /// Queue a job. Fails once the executor has been shut down.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or(Error::ObjectDisposed("executor"))?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(Box::new(job)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Error::ObjectDisposed("executor")
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs, let queued ones finish and join the workers
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        debug!("Executor shut down");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(worker_id: usize, rx: Receiver<Job>, pending: Arc<AtomicUsize>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job on worker {} panicked", worker_id);
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}
