use super::ticker::Ticker;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Something holding idle resources the shared purge timer should sweep
pub trait Purgeable: Send + Sync {
    /// Drop expired or dead idle entries, returning how many went
    fn purge_idle(&self) -> usize;

    fn purge_name(&self) -> String;
}

/// Allocation identity of a registrant
pub(crate) fn registrant_key<T: ?Sized>(target: &Weak<T>) -> usize {
    target.as_ptr() as *const () as usize
}

/// One timer for every registered pool.
///
/// The thread starts with the first registration and stops after the last
/// one goes away. Registrants are held weakly, so a dropped pool simply
/// falls out of the registry on the next sweep.
pub struct IdlePurger {
    registry: Arc<Mutex<Vec<(usize, Weak<dyn Purgeable>)>>>,
    ticker: Ticker,
}

impl IdlePurger {
    pub fn new(interval: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            ticker: Ticker::new("purger", interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.ticker.interval()
    }

    pub fn register(&self, target: Weak<dyn Purgeable>) {
        let key = registrant_key(&target);
        {
            let mut registry = self.registry.lock();
            if registry.iter().any(|(k, _)| *k == key) {
                return;
            }
            registry.push((key, target));
        }
        // Emptiness is re-read under the ticker lock; an unregister racing
        // with this either sees the new entry or stops before this starts
        let registry = Arc::clone(&self.registry);
        self.ticker.start_if(
            || !self.registry.lock().is_empty(),
            move || {
                sweep(&registry);
            },
        );
    }

    pub fn unregister(&self, target: &Weak<dyn Purgeable>) {
        let key = registrant_key(target);
        self.registry.lock().retain(|(k, _)| *k != key);
        self.ticker.stop_if(|| self.registry.lock().is_empty());
    }

    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Run one sweep on the calling thread
    pub fn sweep_now(&self) -> usize {
        sweep(&self.registry)
    }

    pub fn stop(&self) {
        self.ticker.stop();
        self.registry.lock().clear();
    }
}

fn sweep(registry: &Mutex<Vec<(usize, Weak<dyn Purgeable>)>>) -> usize {
    let targets: Vec<Arc<dyn Purgeable>> = {
        let mut registry = registry.lock();
        registry.retain(|(_, target)| target.strong_count() > 0);
        registry.iter().filter_map(|(_, t)| t.upgrade()).collect()
    };

    let mut purged = 0;
    for target in targets {
        let n = target.purge_idle();
        if n > 0 {
            debug!("Purged {} idle connections from {}", n, target.purge_name());
        }
        purged += n;
    }
    trace!("Purge sweep done ({} removed)", purged);
    purged
}
