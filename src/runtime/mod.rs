//! Process-owned services shared by pools and channels
//!
//! A [`ClientRuntime`] bundles the worker pool, the idle purge timer and the
//! heartbeat monitor. Clients normally share [`ClientRuntime::shared`]; tests
//! and embedders that want isolation build their own.

pub mod executor;
pub mod mailbox;
pub mod purger;
pub mod ticker;

use crate::config::Config;
use crate::error::Result;
use crate::heartbeat::Cardio;
use executor::Executor;
use once_cell::sync::OnceCell;
use purger::IdlePurger;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub worker_threads: usize,
    pub purge_interval: Duration,
    /// Scheduler granularity of the heartbeat monitor
    pub heartbeat_tick: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(2, 16),
            purge_interval: Duration::from_secs(1),
            heartbeat_tick: Duration::from_millis(100),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            purge_interval: config.idle_purge_interval(),
            heartbeat_tick: config
                .heartbeat_interval()
                .min(Duration::from_millis(100))
                .max(Duration::from_millis(10)),
            ..Default::default()
        }
    }
}

pub struct ClientRuntime {
    executor: Arc<Executor>,
    purger: IdlePurger,
    cardio: Cardio,
}

static SHARED: OnceCell<Arc<ClientRuntime>> = OnceCell::new();

impl ClientRuntime {
    pub fn new(options: RuntimeOptions) -> Result<Arc<Self>> {
        let executor = Arc::new(Executor::new(options.worker_threads)?);
        let cardio = Cardio::new(Arc::clone(&executor), options.heartbeat_tick);
        Ok(Arc::new(Self {
            executor,
            purger: IdlePurger::new(options.purge_interval),
            cardio,
        }))
    }

    /// The process-wide runtime, created on first use
    pub fn shared() -> Result<Arc<Self>> {
        SHARED
            .get_or_try_init(|| {
                let options = RuntimeOptions::default();
                info!(
                    "Starting shared client runtime with {} workers",
                    options.worker_threads
                );
                Self::new(options)
            })
            .map(Arc::clone)
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn purger(&self) -> &IdlePurger {
        &self.purger
    }

    pub fn cardio(&self) -> &Cardio {
        &self.cardio
    }

    /// Stop the timers and the workers. Pools still using this runtime will
    /// see `ObjectDisposed` on their next async submission.
    pub fn shutdown(&self) {
        self.cardio.stop();
        self.purger.stop();
        self.executor.shutdown();
        info!("Client runtime shut down");
    }
}
