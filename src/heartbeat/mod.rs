//! Heartbeat monitor ("Cardio")
//!
//! Pools and channels register themselves as [`Probe`]s. A scheduler thread
//! wakes on a fixed tick, and every due registration gets one pulse on the
//! shared executor. A pulse still in flight when the next one falls due is
//! skipped rather than queued.

use crate::error::Result;
use crate::runtime::executor::Executor;
use crate::runtime::purger::registrant_key;
use crate::runtime::ticker::Ticker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A target the heartbeat monitor can check
pub trait Probe: Send + Sync {
    fn probe_name(&self) -> String;

    /// One liveness check bounded by `timeout`
    fn pulse(&self, timeout: Duration) -> Result<()>;

    /// Called on the executor when liveness or the fail count changes
    fn pulse_state_changed(&self, _event: &PulseEvent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulseEvent {
    pub probe: String,
    pub alive: bool,
    pub fail_count: u32,
    /// Failure message of the pulse that caused the change
    pub error: Option<String>,
}

type Listener = Arc<dyn Fn(&PulseEvent) + Send + Sync>;

struct Registration {
    key: usize,
    probe: Weak<dyn Probe>,
    interval: Duration,
    probe_timeout: Duration,
    fail_count: AtomicU32,
    alive: AtomicBool,
    pulsing: AtomicBool,
    next_due: Mutex<Instant>,
}

struct Shared {
    registrations: Mutex<Vec<Arc<Registration>>>,
    listeners: Mutex<Vec<Listener>>,
    executor: Arc<Executor>,
    pulses: AtomicU64,
    skipped: AtomicU64,
}

pub struct Cardio {
    shared: Arc<Shared>,
    ticker: Ticker,
}

impl Cardio {
    /// `tick` is the scheduler granularity, not a probe interval
    pub fn new(executor: Arc<Executor>, tick: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                registrations: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                executor,
                pulses: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
            ticker: Ticker::new("cardio", tick),
        }
    }

    /// Register a probe. Attaching the same allocation twice is a no-op and
    /// returns false.
    pub fn attach(&self, probe: Weak<dyn Probe>, interval: Duration, probe_timeout: Duration) -> bool {
        let key = registrant_key(&probe);
        let name = match probe.upgrade() {
            Some(p) => p.probe_name(),
            None => return false,
        };

        {
            let mut registrations = self.shared.registrations.lock();
            if registrations.iter().any(|r| r.key == key) {
                return false;
            }
            registrations.push(Arc::new(Registration {
                key,
                probe,
                interval,
                probe_timeout,
                fail_count: AtomicU32::new(0),
                alive: AtomicBool::new(true),
                pulsing: AtomicBool::new(false),
                next_due: Mutex::new(Instant::now() + interval),
            }));
        }

        debug!("Heartbeat attached to {} every {:?}", name, interval);
        let shared = Arc::clone(&self.shared);
        self.ticker.start_if(
            || !self.shared.registrations.lock().is_empty(),
            move || shared.beat(false),
        );
        true
    }

    /// Remove a probe. Returns false when it was not attached.
    pub fn detach(&self, probe: &Weak<dyn Probe>) -> bool {
        let key = registrant_key(probe);
        let found = {
            let mut registrations = self.shared.registrations.lock();
            let before = registrations.len();
            registrations.retain(|r| r.key != key);
            registrations.len() != before
        };
        self.ticker
            .stop_if(|| self.shared.registrations.lock().is_empty());
        found
    }

    pub fn is_attached(&self, probe: &Weak<dyn Probe>) -> bool {
        let key = registrant_key(probe);
        self.shared.registrations.lock().iter().any(|r| r.key == key)
    }

    /// Receive every pulse state change
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&PulseEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    pub fn registered(&self) -> usize {
        self.shared.registrations.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Pulses dispatched so far
    pub fn pulses(&self) -> u64 {
        self.shared.pulses.load(Ordering::Relaxed)
    }

    /// Due pulses skipped because the previous one was still running
    pub fn skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    /// Pulse every registration now, ignoring their schedules
    pub fn pulse_all(&self) {
        self.shared.beat(true);
    }

    /// Last known fail count of a probe
    pub fn fail_count(&self, probe: &Weak<dyn Probe>) -> Option<u32> {
        let key = registrant_key(probe);
        self.shared
            .registrations
            .lock()
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.fail_count.load(Ordering::Acquire))
    }

    pub fn stop(&self) {
        self.ticker.stop();
        self.shared.registrations.lock().clear();
    }
}

impl Shared {
    fn beat(self: &Arc<Self>, force: bool) {
        let now = Instant::now();
        let due: Vec<Arc<Registration>> = {
            let mut registrations = self.registrations.lock();
            registrations.retain(|r| r.probe.strong_count() > 0);
            registrations
                .iter()
                .filter(|r| force || *r.next_due.lock() <= now)
                .cloned()
                .collect()
        };

        for registration in due {
            if registration
                .pulsing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            *registration.next_due.lock() = now + registration.interval;

            let shared = Arc::clone(self);
            let job_registration = Arc::clone(&registration);
            let spawned = self
                .executor
                .spawn(move || shared.pulse(&job_registration));
            if spawned.is_err() {
                registration.pulsing.store(false, Ordering::Release);
            }
        }
    }

    fn pulse(self: &Arc<Self>, registration: &Registration) {
        let probe = match registration.probe.upgrade() {
            Some(probe) => probe,
            None => {
                registration.pulsing.store(false, Ordering::Release);
                return;
            }
        };
        self.pulses.fetch_add(1, Ordering::Relaxed);

        let outcome = probe.pulse(registration.probe_timeout);
        let was_alive = registration.alive.load(Ordering::Acquire);
        let before = registration.fail_count.load(Ordering::Acquire);

        let event = match outcome {
            Ok(()) => {
                registration.fail_count.store(0, Ordering::Release);
                registration.alive.store(true, Ordering::Release);
                (!was_alive || before != 0).then(|| PulseEvent {
                    probe: probe.probe_name(),
                    alive: true,
                    fail_count: 0,
                    error: None,
                })
            }
            Err(e) => {
                let fail_count = registration.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
                registration.alive.store(false, Ordering::Release);
                Some(PulseEvent {
                    probe: probe.probe_name(),
                    alive: false,
                    fail_count,
                    error: Some(e.to_string()),
                })
            }
        };
        registration.pulsing.store(false, Ordering::Release);

        if let Some(event) = event {
            if event.alive {
                info!("{} is alive again", event.probe);
            } else {
                warn!(
                    "Pulse of {} failed ({} in a row): {}",
                    event.probe,
                    event.fail_count,
                    event.error.as_deref().unwrap_or("unknown error")
                );
            }
            self.notify(probe, event);
        }
    }

    /// Notifications run as their own job so a slow listener never holds
    /// the pulsing flag
    fn notify(&self, probe: Arc<dyn Probe>, event: PulseEvent) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        let _ = self.executor.spawn(move || {
            probe.pulse_state_changed(&event);
            for listener in listeners {
                listener(&event);
            }
        });
    }
}

impl Drop for Cardio {
    fn drop(&mut self) {
        self.ticker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::mpsc;
    use std::thread;

    struct Flaky {
        healthy: AtomicBool,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Flaky {
        fn new(healthy: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicU32::new(0),
                delay,
            })
        }
    }

    impl Probe for Flaky {
        fn probe_name(&self) -> String {
            "flaky".into()
        }

        fn pulse(&self, _timeout: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::timeout("no pong"))
            }
        }
    }

    fn cardio() -> Cardio {
        Cardio::new(Arc::new(Executor::new(2).unwrap()), Duration::from_millis(5))
    }

    #[test]
    fn attach_and_detach_are_idempotent() {
        let cardio = cardio();
        let probe: Arc<dyn Probe> = Flaky::new(true, Duration::ZERO);
        let weak = Arc::downgrade(&probe);

        assert!(cardio.attach(weak.clone(), Duration::from_secs(60), Duration::from_millis(10)));
        assert!(!cardio.attach(weak.clone(), Duration::from_secs(60), Duration::from_millis(10)));
        assert_eq!(cardio.registered(), 1);
        assert!(cardio.is_running());

        assert!(cardio.detach(&weak));
        assert!(!cardio.detach(&weak));
        assert!(!cardio.is_running());
    }

    #[test]
    fn overlapping_attach_and_detach_leave_the_beat_running() {
        let cardio = Arc::new(cardio());
        let steady: Arc<dyn Probe> = Flaky::new(true, Duration::ZERO);
        let churn: Arc<dyn Probe> = Flaky::new(true, Duration::ZERO);

        let handles: Vec<_> = [Arc::clone(&steady), Arc::clone(&churn)]
            .into_iter()
            .map(|probe| {
                let cardio = Arc::clone(&cardio);
                thread::spawn(move || {
                    let weak = Arc::downgrade(&probe);
                    for _ in 0..200 {
                        cardio.attach(weak.clone(), Duration::from_secs(60), Duration::from_millis(10));
                        cardio.detach(&weak);
                    }
                    cardio.attach(weak, Duration::from_secs(60), Duration::from_millis(10));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cardio.registered(), 2);
        assert!(cardio.is_running());
    }

    #[test]
    fn failures_count_up_and_recovery_resets() {
        let cardio = cardio();
        let flaky = Flaky::new(false, Duration::ZERO);
        let probe: Arc<dyn Probe> = flaky.clone();
        let weak = Arc::downgrade(&probe);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        cardio.subscribe(move |event| {
            let _ = tx.lock().send(event.clone());
        });
        cardio.attach(weak.clone(), Duration::from_secs(60), Duration::from_millis(10));

        cardio.pulse_all();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!event.alive);
        assert_eq!(event.fail_count, 1);

        cardio.pulse_all();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.fail_count, 2);

        flaky.healthy.store(true, Ordering::SeqCst);
        cardio.pulse_all();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.alive);
        assert_eq!(event.fail_count, 0);
        assert_eq!(cardio.fail_count(&weak), Some(0));
    }

    #[test]
    fn in_flight_pulse_is_skipped() {
        let cardio = cardio();
        let flaky = Flaky::new(true, Duration::from_millis(200));
        let probe: Arc<dyn Probe> = flaky.clone();
        cardio.attach(Arc::downgrade(&probe), Duration::from_secs(60), Duration::from_millis(10));

        cardio.pulse_all();
        thread::sleep(Duration::from_millis(50));
        cardio.pulse_all();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cardio.skipped(), 1);
    }
}
