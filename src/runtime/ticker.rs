use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct Running {
    signal: Arc<Signal>,
    handle: JoinHandle<()>,
}

/// Background thread that calls a closure at a fixed interval until stopped.
/// Can be started again after a stop.
pub struct Ticker {
    name: &'static str,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Ticker {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval: interval.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start the thread. Returns false if it was already running.
    pub fn start<F>(&self, tick: F) -> bool
    where
        F: Fn() + Send + 'static,
    {
        self.start_if(|| true, tick)
    }

    /// Start the thread when `wanted` holds. `wanted` is evaluated under the
    /// same lock [`stop_if`](Self::stop_if) uses, so a start and a stop
    /// deciding on shared state cannot interleave.
    pub fn start_if<C, F>(&self, wanted: C, tick: F) -> bool
    where
        C: FnOnce() -> bool,
        F: Fn() + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() || !wanted() {
            return false;
        }

        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let interval = self.interval;
        let name = self.name;

        let spawned = thread::Builder::new()
            .name(format!("feox-{}", name))
            .spawn(move || {
                debug!("{} ticker started ({:?})", name, interval);
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if !*stopped {
                            thread_signal.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    tick();
                }
                debug!("{} ticker stopped", name);
            });

        match spawned {
            Ok(handle) => {
                *running = Some(Running { signal, handle });
                true
            }
            Err(e) => {
                error!("Failed to start {} ticker: {}", self.name, e);
                false
            }
        }
    }

    /// Stop the thread and wait for an in-flight tick to finish
    pub fn stop(&self) {
        self.stop_if(|| true);
    }

    /// Stop the thread only if `idle` still holds once the run lock is
    /// taken. Returns whether a running thread was stopped.
    pub fn stop_if<C>(&self, idle: C) -> bool
    where
        C: FnOnce() -> bool,
    {
        let running = {
            let mut running = self.running.lock();
            if running.is_some() && idle() {
                running.take()
            } else {
                None
            }
        };
        let stopped = running.is_some();
        if let Some(running) = running {
            *running.signal.stopped.lock() = true;
            running.signal.wake.notify_all();
            if running.handle.thread().id() != thread::current().id() {
                let _ = running.handle.join();
            }
        }
        stopped
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
