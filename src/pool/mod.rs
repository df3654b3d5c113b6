//! Bounded connection pool
//!
//! A pool hands out at most `max_connections` connections at once. Released
//! connections park in an [`IdleStore`] keyed by db and role until they are
//! reused or purged by the shared timer.

pub mod idle;
pub mod limiter;

use crate::config::Config;
use crate::error::{ConnectionErrorKind, Error, Result};
use crate::heartbeat::Probe;
use crate::network::{Connection, ConnectionSettings};
use crate::protocol::{Command, Expectation, RespValue, Role, SendType};
use crate::request::future::ResponseFuture;
use crate::request::queue::{AsyncProcessor, Dispatcher};
use crate::request::{AsyncRequest, PendingRequest};
use crate::runtime::executor::Executor;
use crate::runtime::purger::Purgeable;
use crate::runtime::ClientRuntime;
use idle::IdleStore;
use limiter::ConnectionLimiter;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub(crate) type Connector = Arc<dyn Fn() -> Result<Connection> + Send + Sync>;

/// Something the pool tears down when it is disposed
pub(crate) trait OwnedChannel: Send + Sync {
    fn dispose(&self);
}

struct Endpoint {
    addr: SocketAddr,
    role: AtomicU8,
}

impl Endpoint {
    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub available: usize,
    pub idle: usize,
    pub max: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

pub(crate) struct PoolCore {
    name: String,
    endpoints: Vec<Endpoint>,
    next_endpoint: AtomicUsize,
    settings: ConnectionSettings,
    limiter: ConnectionLimiter,
    idle: IdleStore,
    executor: Arc<Executor>,
    wait_timeout: Duration,
    idle_timeout: Duration,
    disposed: AtomicBool,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl PoolCore {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::ObjectDisposed("connection pool"))
        } else {
            Ok(())
        }
    }

    fn acquire_within(
        self: &Arc<Self>,
        db: u32,
        role: Role,
        wait: Duration,
    ) -> Result<Option<PooledConnection>> {
        self.check_disposed()?;
        if !self.limiter.acquire(wait) {
            trace!("{}: no free slot within {:?}", self.name, wait);
            return Ok(None);
        }
        if let Err(e) = self.check_disposed() {
            self.limiter.release();
            return Err(e);
        }

        match self.checkout(db, role) {
            Ok(conn) => Ok(Some(PooledConnection {
                conn: Some(conn),
                core: Arc::clone(self),
                discard: false,
            })),
            Err(e) => {
                self.limiter.release();
                Err(e)
            }
        }
    }

    fn checkout(&self, db: u32, role: Role) -> Result<Connection> {
        if let Some(conn) = self.idle.dequeue(db, role) {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(conn);
        }
        if role == Role::Slave {
            if let Some(conn) = self.idle.dequeue(db, Role::Master) {
                trace!("{}: no idle slave, using master {}", self.name, conn.id());
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
        }
        self.open(db, role)
    }

    /// Endpoints to try for `role`, round-robin. Slave requests fall back to
    /// masters after every slave candidate.
    fn candidates(&self, role: Role) -> Vec<&Endpoint> {
        let n = self.endpoints.len();
        let start = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let ordered: Vec<&Endpoint> = (0..n)
            .map(|i| &self.endpoints[(start + i) % n])
            .collect();

        let mut candidates: Vec<&Endpoint> = ordered
            .iter()
            .copied()
            .filter(|e| e.role().serves(role))
            .collect();
        if role == Role::Slave {
            candidates.extend(ordered.iter().copied().filter(|e| e.role() == Role::Master));
        }
        candidates
    }

    fn open(&self, db: u32, role: Role) -> Result<Connection> {
        let candidates = self.candidates(role);
        if candidates.is_empty() {
            return Err(Error::connection(
                ConnectionErrorKind::Refused,
                format!("no endpoint of {} serves role {}", self.name, role),
            ));
        }

        let mut last_error = None;
        for endpoint in candidates {
            match Connection::connect(endpoint.addr, db, &self.settings) {
                Ok(conn) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    if conn.role() != Role::Unknown {
                        endpoint.role.store(conn.role().as_u8(), Ordering::Release);
                    }
                    let acceptable = conn.role().serves(role)
                        || (role == Role::Slave && conn.role() == Role::Master);
                    if acceptable {
                        return Ok(conn);
                    }
                    debug!(
                        "{}: {} turned out to be {}, wanted {}",
                        self.name,
                        endpoint.addr,
                        conn.role(),
                        role
                    );
                    self.idle.push(conn);
                }
                Err(e) => {
                    warn!("{}: connect to {} failed: {}", self.name, endpoint.addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::connection(
                ConnectionErrorKind::Refused,
                format!("no endpoint of {} serves role {}", self.name, role),
            )
        }))
    }

    fn release(&self, conn: Connection, discard: bool) {
        if discard || !conn.is_usable() || self.disposed.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!("{}: discarding connection {}", self.name, conn.id());
            drop(conn);
        } else {
            self.idle.push(conn);
        }
        self.limiter.release();
    }

    /// A dedicated connection outside the limiter, for streaming channels
    fn open_dedicated(&self, db: u32) -> Result<Connection> {
        self.check_disposed()?;
        self.open(db, Role::Any)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.limiter.in_use_count(),
            available: self.limiter.available_count(),
            idle: self.idle.len(),
            max: self.limiter.max(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Round trip honouring the command's send type. Fire-and-forget commands
/// yield `None` since their reply is never read.
fn run_command(conn: &mut PooledConnection, cmd: &Command) -> Result<Option<RespValue>> {
    match cmd.send_type() {
        SendType::RoundTrip => conn.send_receive(cmd).map(Some),
        SendType::FireAndForget => {
            conn.send(cmd)?;
            // The reply is never read, so the session cannot be reused
            conn.discard();
            Ok(None)
        }
    }
}

impl Purgeable for PoolCore {
    fn purge_idle(&self) -> usize {
        self.idle.purge(self.idle_timeout)
    }

    fn purge_name(&self) -> String {
        self.name.clone()
    }
}

/// A connection checked out of a pool.
///
/// Dropping it returns the connection to the idle store (or closes it if it
/// faulted) and gives back the pool slot.
pub struct PooledConnection {
    conn: Option<Connection>,
    core: Arc<PoolCore>,
    discard: bool,
}

impl PooledConnection {
    fn inner(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or(Error::ObjectDisposed("pooled connection"))
    }

    fn inner_ref(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    pub fn id(&self) -> Option<usize> {
        self.inner_ref().map(Connection::id)
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.inner_ref().map(Connection::endpoint)
    }

    pub fn db(&self) -> Option<u32> {
        self.inner_ref().map(Connection::db)
    }

    pub fn role(&self) -> Role {
        self.inner_ref().map(Connection::role).unwrap_or(Role::Unknown)
    }

    pub fn is_usable(&self) -> bool {
        !self.discard && self.inner_ref().is_some_and(Connection::is_usable)
    }

    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        self.inner()?.send(cmd)
    }

    pub fn send_receive(&mut self, cmd: &Command) -> Result<RespValue> {
        self.inner()?.send_receive(cmd)
    }

    pub fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<RespValue>> {
        self.inner()?.pipeline(cmds)
    }

    pub fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.inner()?.ping(timeout)
    }

    /// Close the connection on release instead of pooling it
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Run `cmd` on the shared executor. The connection goes back to the
    /// pool when the round trip finishes.
    pub fn send_async<E: Expectation>(self, cmd: Command) -> Result<ResponseFuture<E::Output>> {
        cmd.validate()?;
        let executor = Arc::clone(&self.core.executor);
        let (request, future) = AsyncRequest::<E>::new(cmd, self.core.wait_timeout);
        let mut conn = self;
        executor.spawn(move || {
            if request.initiate() {
                let reply = run_command(&mut conn, request.command());
                request.settle(reply);
            }
        })?;
        Ok(future)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.core.release(conn, self.discard);
        }
    }
}

/// Dispatch target of the async processor. Holds the core weakly so queued
/// work never keeps a dropped pool alive.
struct WeakDispatch(Weak<PoolCore>);

impl Dispatcher for WeakDispatch {
    fn dispatch(&self, command: &Command, wait: Duration) -> Result<Option<RespValue>> {
        let core = self
            .0
            .upgrade()
            .ok_or(Error::ObjectDisposed("connection pool"))?;
        dispatch_on(&core, command, wait)
    }
}

fn dispatch_on(core: &Arc<PoolCore>, command: &Command, wait: Duration) -> Result<Option<RespValue>> {
    let mut conn = core
        .acquire_within(command.db(), command.role(), wait)?
        .ok_or_else(|| {
            Error::timeout(format!(
                "no connection from {} within {:?}",
                core.name, wait
            ))
        })?;
    run_command(&mut conn, command)
}

/// Heartbeat view of a pool
struct PoolProbe(Weak<PoolCore>);

impl Probe for PoolProbe {
    fn probe_name(&self) -> String {
        self.0
            .upgrade()
            .map(|core| core.name.clone())
            .unwrap_or_else(|| "disposed pool".to_string())
    }

    fn pulse(&self, timeout: Duration) -> Result<()> {
        let core = self
            .0
            .upgrade()
            .ok_or(Error::ObjectDisposed("connection pool"))?;
        pulse_pool(&core, timeout)
    }
}

/// Ping every idle connection, dropping the ones that fail. Connections are
/// taken out one at a time so acquires keep finding the rest. With nothing
/// idle and nothing in use, a fresh connection is opened and pinged.
fn pulse_pool(core: &Arc<PoolCore>, timeout: Duration) -> Result<()> {
    core.check_disposed()?;
    let mut pinged = 0;
    let mut last_error = None;

    let failed = core.idle.retain_checked(|conn| match conn.ping(timeout) {
        Ok(()) => {
            pinged += 1;
            true
        }
        Err(e) => {
            debug!("{}: idle connection {} failed its pulse: {}", core.name, conn.id(), e);
            last_error = Some(e);
            false
        }
    });
    core.discarded
        .fetch_add(failed.len() as u64, Ordering::Relaxed);
    drop(failed);

    if pinged > 0 {
        return Ok(());
    }
    if let Some(e) = last_error {
        return Err(e);
    }
    if core.limiter.in_use_count() > 0 {
        return Ok(());
    }

    match core.acquire_within(0, Role::Any, Duration::ZERO)? {
        Some(mut conn) => {
            let result = conn.ping(timeout);
            if result.is_err() {
                conn.discard();
            }
            result
        }
        None => Ok(()),
    }
}

/// Pool of connections to one logical server (one or more endpoints)
pub struct ConnectionPool {
    core: Arc<PoolCore>,
    runtime: Arc<ClientRuntime>,
    probe: Option<Arc<dyn Probe>>,
    purge_target: Arc<dyn Purgeable>,
    processor: AsyncProcessor,
    _dispatcher: Arc<dyn Dispatcher>,
    channels: Mutex<Vec<Weak<dyn OwnedChannel>>>,
    async_completion: bool,
    async_timeout: Duration,
    heartbeat: Option<(Duration, Duration)>,
    pubsub_reconnect: bool,
}

impl ConnectionPool {
    pub fn new(config: &Config, runtime: Arc<ClientRuntime>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;
        let addrs = config
            .resolve_endpoints()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;

        let name = format!("pool[{}]", config.endpoints.join(","));
        let core = Arc::new(PoolCore {
            name,
            endpoints: addrs
                .into_iter()
                .map(|addr| Endpoint {
                    addr,
                    role: AtomicU8::new(Role::Unknown.as_u8()),
                })
                .collect(),
            next_endpoint: AtomicUsize::new(0),
            settings: ConnectionSettings::from_config(config),
            limiter: ConnectionLimiter::new(config.max_connections),
            idle: IdleStore::new(),
            executor: Arc::clone(runtime.executor()),
            wait_timeout: config.wait_timeout(),
            idle_timeout: config.idle_timeout(),
            disposed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        let purge_target: Arc<dyn Purgeable> = core.clone();
        runtime.purger().register(Arc::downgrade(&purge_target));

        let probe = if config.heartbeat_enabled {
            let probe: Arc<dyn Probe> = Arc::new(PoolProbe(Arc::downgrade(&core)));
            runtime.cardio().attach(
                Arc::downgrade(&probe),
                config.heartbeat_interval(),
                config.heartbeat_probe_timeout(),
            );
            Some(probe)
        } else {
            None
        };

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(WeakDispatch(Arc::downgrade(&core)));
        let processor = AsyncProcessor::start(Arc::downgrade(&dispatcher), config.async_timeout())?;

        info!(
            "{} ready (max {} connections)",
            core.name, config.max_connections
        );
        Ok(Self {
            core,
            runtime,
            probe,
            purge_target,
            processor,
            _dispatcher: dispatcher,
            channels: Mutex::new(Vec::new()),
            async_completion: config.async_completion,
            async_timeout: config.async_timeout(),
            heartbeat: config
                .heartbeat_enabled
                .then(|| (config.heartbeat_interval(), config.heartbeat_probe_timeout())),
            pubsub_reconnect: config.pubsub_reconnect,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Take a connection, waiting up to the configured wait timeout.
    /// Running out of time is a `Timeout` connection error.
    pub fn acquire(&self, db: u32, role: Role) -> Result<PooledConnection> {
        self.try_acquire(db, role)?.ok_or_else(|| {
            Error::timeout(format!(
                "no connection from {} within {:?}",
                self.core.name, self.core.wait_timeout
            ))
        })
    }

    /// Like [`acquire`](Self::acquire) but running out of time is `Ok(None)`
    pub fn try_acquire(&self, db: u32, role: Role) -> Result<Option<PooledConnection>> {
        self.core.acquire_within(db, role, self.core.wait_timeout)
    }

    pub fn acquire_timeout(
        &self,
        db: u32,
        role: Role,
        wait: Duration,
    ) -> Result<Option<PooledConnection>> {
        self.core.acquire_within(db, role, wait)
    }

    /// Blocking execution. When async completion is on and no slot frees up
    /// in time, the request is queued and this waits on its future instead.
    pub fn execute<E: Expectation>(&self, cmd: Command) -> Result<E::Output> {
        cmd.validate()?;
        match self.try_acquire(cmd.db(), cmd.role())? {
            Some(mut conn) => {
                let reply = run_command(&mut conn, &cmd)?;
                E::project_reply(reply, cmd.throw_on_error())
            }
            None if self.async_completion => self
                .processor
                .enqueue::<E>(cmd)?
                .wait_timeout(self.async_timeout),
            None => Err(Error::timeout(format!(
                "no connection from {} within {:?}",
                self.core.name, self.core.wait_timeout
            ))),
        }
    }

    /// Blocking execution without a projection, for callers that pick the
    /// result shape at runtime. `None` for fire-and-forget commands.
    pub(crate) fn execute_reply(&self, cmd: &Command) -> Result<Option<RespValue>> {
        cmd.validate()?;
        let mut conn = self.acquire(cmd.db(), cmd.role())?;
        run_command(&mut conn, cmd)
    }

    /// Non-blocking execution returning a future. Without a free slot the
    /// request goes to the overflow queue, whose own worker waits for one;
    /// the shared executor never blocks on an acquire. The request lives for
    /// the async timeout when async completion is on, else the wait timeout.
    pub fn execute_async<E: Expectation>(&self, cmd: Command) -> Result<ResponseFuture<E::Output>> {
        cmd.validate()?;
        if let Some(conn) = self
            .core
            .acquire_within(cmd.db(), cmd.role(), Duration::ZERO)?
        {
            return conn.send_async::<E>(cmd);
        }
        let lifetime = if self.async_completion {
            self.async_timeout
        } else {
            self.core.wait_timeout
        };
        self.processor.enqueue_with_timeout::<E>(cmd, lifetime)
    }

    /// Sweep the idle store now
    pub fn purge(&self) -> usize {
        self.core.purge_idle()
    }

    pub fn stats(&self) -> PoolStats {
        self.core.stats()
    }

    pub fn in_use_count(&self) -> usize {
        self.core.limiter.in_use_count()
    }

    pub fn available_count(&self) -> usize {
        self.core.limiter.available_count()
    }

    pub fn idle_count(&self) -> usize {
        self.core.idle.len()
    }

    pub fn max_connections(&self) -> usize {
        self.core.limiter.max()
    }

    pub fn queued_count(&self) -> usize {
        self.processor.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> &Arc<ClientRuntime> {
        &self.runtime
    }

    /// Opens dedicated connections outside the limiter, for streaming
    /// channels. Fails once the pool is gone or disposed.
    pub(crate) fn connector(&self) -> Connector {
        let core = Arc::downgrade(&self.core);
        Arc::new(move || {
            core.upgrade()
                .ok_or(Error::ObjectDisposed("connection pool"))?
                .open_dedicated(0)
        })
    }

    pub(crate) fn adopt(&self, channel: Weak<dyn OwnedChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(channel);
    }

    /// Heartbeat interval and probe timeout, when heartbeats are enabled
    pub(crate) fn heartbeat(&self) -> Option<(Duration, Duration)> {
        self.heartbeat
    }

    pub(crate) fn pubsub_reconnect(&self) -> bool {
        self.pubsub_reconnect
    }

    /// Tear the pool down. Later acquires fail with `ObjectDisposed`; queued
    /// async requests fail the same way.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(probe) = &self.probe {
            self.runtime.cardio().detach(&Arc::downgrade(probe));
        }
        self.runtime
            .purger()
            .unregister(&Arc::downgrade(&self.purge_target));

        self.processor.stop();

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.dispose();
        }

        let dropped = self.core.idle.clear();
        info!(
            "{} disposed ({} idle connections closed)",
            self.core.name, dropped
        );
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}
