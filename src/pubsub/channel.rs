use super::message::{Message, PubSubMessage};
use super::registry::{MessageCallback, SubscriptionRegistry};
use super::PubSubStats;
use crate::error::{ConnectionErrorKind, Error, Result};
use crate::heartbeat::Probe;
use crate::network::{ReceiveEnd, ReceiveHandle};
use crate::pool::{ConnectionPool, Connector, OwnedChannel};
use crate::protocol::{Command, RespValue};
use crate::runtime::executor::Executor;
use crate::runtime::ClientRuntime;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

type EndCallback = Arc<dyn Fn(&ReceiveEnd) + Send + Sync>;

#[derive(Clone, Copy)]
enum Axis {
    Channel,
    Pattern,
}

impl Axis {
    fn subscribe_verb(self) -> &'static str {
        match self {
            Axis::Channel => "SUBSCRIBE",
            Axis::Pattern => "PSUBSCRIBE",
        }
    }

    fn unsubscribe_verb(self) -> &'static str {
        match self {
            Axis::Channel => "UNSUBSCRIBE",
            Axis::Pattern => "PUNSUBSCRIBE",
        }
    }
}

struct ChannelInner {
    name: String,
    connector: Connector,
    executor: Arc<Executor>,
    channels: SubscriptionRegistry,
    patterns: SubscriptionRegistry,
    handle: Mutex<Option<Arc<ReceiveHandle>>>,
    generation: AtomicU64,
    pongs: (Sender<()>, Receiver<()>),
    on_end: Mutex<Option<EndCallback>>,
    auto_reconnect: bool,
    disposed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelInner {
    fn registry(&self, axis: Axis) -> &SubscriptionRegistry {
        match axis {
            Axis::Channel => &self.channels,
            Axis::Pattern => &self.patterns,
        }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::ObjectDisposed("pub/sub channel"))
        } else {
            Ok(())
        }
    }

    fn current(&self) -> Result<Arc<ReceiveHandle>> {
        self.check_disposed()?;
        self.handle
            .lock()
            .clone()
            .ok_or_else(|| {
                Error::connection(
                    ConnectionErrorKind::Closed,
                    format!("{} has no live connection", self.name),
                )
            })
    }

    /// Open a connection and start its receive loop, replacing any previous one
    fn connect(self: &Arc<Self>) -> Result<()> {
        self.check_disposed()?;
        let conn = (self.connector)()?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let endpoint = conn.endpoint();

        let frames = Arc::downgrade(self);
        let ends = Arc::downgrade(self);
        let handle = conn.into_receiver(
            move |frame| {
                if let Some(inner) = frames.upgrade() {
                    inner.handle_frame(frame);
                }
            },
            move |end| {
                if let Some(inner) = ends.upgrade() {
                    inner.handle_end(generation, end);
                }
            },
        )?;

        let previous = self.handle.lock().replace(Arc::new(handle));
        if let Some(previous) = previous {
            previous.stop();
        }
        debug!("{} streaming from {}", self.name, endpoint);
        Ok(())
    }

    fn handle_frame(&self, frame: RespValue) {
        let message = match PubSubMessage::from_resp(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} ignored a frame: {}", self.name, e);
                return;
            }
        };

        match message {
            PubSubMessage::Message { channel, payload } => {
                let message = Message {
                    channel: channel.clone(),
                    pattern: None,
                    payload,
                };
                self.dispatch(&self.channels, &channel, message);
            }
            PubSubMessage::PatternMessage {
                pattern,
                channel,
                payload,
            } => {
                let message = Message {
                    channel,
                    pattern: Some(pattern.clone()),
                    payload,
                };
                self.dispatch(&self.patterns, &pattern, message);
            }
            PubSubMessage::Subscribe { channel, count } => {
                let moved = self.channels.confirm(&channel);
                trace!("{} confirmed channel ({} callbacks, {} total)", self.name, moved, count);
            }
            PubSubMessage::PSubscribe { pattern, count } => {
                let moved = self.patterns.confirm(&pattern);
                trace!("{} confirmed pattern ({} callbacks, {} total)", self.name, moved, count);
            }
            PubSubMessage::Unsubscribe { count, .. } | PubSubMessage::PUnsubscribe { count, .. } => {
                trace!("{} unsubscribe acknowledged ({} left)", self.name, count);
            }
            PubSubMessage::Pong { .. } => {
                let _ = self.pongs.0.try_send(());
            }
        }
    }

    fn dispatch(&self, registry: &SubscriptionRegistry, key: &[u8], message: Message) {
        let subscribers = registry.subscribers(key);
        if subscribers.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        for subscriber in subscribers {
            subscriber.deliver(message.clone(), &self.executor);
        }
    }

    fn handle_end(self: &Arc<Self>, generation: u64, end: ReceiveEnd) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        {
            let mut handle = self.handle.lock();
            if self.generation.load(Ordering::Acquire) == generation {
                *handle = None;
            }
        }

        match &end {
            ReceiveEnd::Stopped => debug!("{} stopped", self.name),
            ReceiveEnd::Closed => warn!("{} closed by server", self.name),
            ReceiveEnd::Faulted(e) => warn!("{} faulted: {}", self.name, e),
        }

        let on_end = self.on_end.lock().clone();
        if let Some(on_end) = on_end {
            on_end(&end);
        }

        let lost = !matches!(end, ReceiveEnd::Stopped);
        if lost && self.auto_reconnect && !self.disposed.load(Ordering::Acquire) {
            let inner = Arc::clone(self);
            let _ = self.executor.spawn(move || {
                if let Err(e) = inner.reconnect() {
                    warn!("{} could not reconnect: {}", inner.name, e);
                }
            });
        }
    }

    fn subscribe(&self, axis: Axis, callback: MessageCallback, names: Vec<Bytes>) -> Result<()> {
        self.check_disposed()?;
        if names.iter().any(|n| n.is_empty()) {
            return Err(Error::MissingParameter("empty channel name".to_string()));
        }
        let registry = self.registry(axis);
        let fresh: Vec<Bytes> = names
            .into_iter()
            .filter(|name| registry.add_pending(name.clone(), &callback))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let cmd = Command::new(0, axis.subscribe_verb()).args(fresh.iter().cloned());
        let sent = self.current().and_then(|handle| handle.send(&cmd));
        if let Err(e) = sent {
            for name in &fresh {
                registry.remove_pending(name, &callback);
            }
            return Err(e);
        }
        Ok(())
    }

    fn unsubscribe(&self, axis: Axis, names: Vec<Bytes>) -> Result<()> {
        self.check_disposed()?;
        let registry = self.registry(axis);
        if names.is_empty() {
            registry.clear();
        } else {
            for name in &names {
                registry.remove(name);
            }
        }
        let cmd = Command::new(0, axis.unsubscribe_verb()).args(names);
        self.current()?.send(&cmd)
    }

    fn ping(&self, timeout: Duration) -> Result<()> {
        let handle = self.current()?;
        while self.pongs.1.try_recv().is_ok() {}
        handle.send(&Command::new(0, "PING"))?;
        self.pongs.1.recv_timeout(timeout).map_err(|_| {
            Error::timeout(format!("{} got no pong within {:?}", self.name, timeout))
        })
    }

    fn resubscribe(&self, axis: Axis) -> Result<usize> {
        let names = self.registry(axis).requeue_confirmed();
        if names.is_empty() {
            return Ok(0);
        }
        let n = names.len();
        let cmd = Command::new(0, axis.subscribe_verb()).args(names);
        self.current()?.send(&cmd)?;
        Ok(n)
    }

    fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.connect()?;
        let channels = self.resubscribe(Axis::Channel)?;
        let patterns = self.resubscribe(Axis::Pattern)?;
        info!(
            "{} reconnected ({} channels, {} patterns resent)",
            self.name, channels, patterns
        );
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
        self.channels.clear();
        self.patterns.clear();
        debug!("{} disposed", self.name);
    }
}

struct ChannelProbe(Weak<ChannelInner>);

impl Probe for ChannelProbe {
    fn probe_name(&self) -> String {
        self.0
            .upgrade()
            .map(|inner| inner.name.clone())
            .unwrap_or_else(|| "disposed pub/sub channel".to_string())
    }

    fn pulse(&self, timeout: Duration) -> Result<()> {
        self.0
            .upgrade()
            .ok_or(Error::ObjectDisposed("pub/sub channel"))?
            .ping(timeout)
    }
}

/// Subscribed connection with callback dispatch.
///
/// Callbacks only receive messages once the server acknowledged the
/// subscription. Each callback drains its own mailbox on the shared executor,
/// so one slow or panicking subscriber never holds up another.
pub struct PubSubChannel {
    inner: Arc<ChannelInner>,
    runtime: Arc<ClientRuntime>,
    probe: Option<Arc<dyn Probe>>,
}

impl PubSubChannel {
    /// Open a dedicated connection from `pool`. The pool disposes the
    /// channel when it is disposed itself.
    pub fn open(pool: &ConnectionPool) -> Result<Arc<Self>> {
        let inner = Arc::new(ChannelInner {
            name: format!("pubsub[{}]", pool.name()),
            connector: pool.connector(),
            executor: Arc::clone(pool.runtime().executor()),
            channels: SubscriptionRegistry::new(),
            patterns: SubscriptionRegistry::new(),
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            pongs: bounded(16),
            on_end: Mutex::new(None),
            auto_reconnect: pool.pubsub_reconnect(),
            disposed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        inner.connect()?;

        let runtime = Arc::clone(pool.runtime());
        let probe = pool.heartbeat().map(|(interval, probe_timeout)| {
            let probe: Arc<dyn Probe> = Arc::new(ChannelProbe(Arc::downgrade(&inner)));
            runtime
                .cardio()
                .attach(Arc::downgrade(&probe), interval, probe_timeout);
            probe
        });

        let channel = Arc::new(Self {
            inner,
            runtime,
            probe,
        });
        let owned: Arc<dyn OwnedChannel> = channel.clone();
        pool.adopt(Arc::downgrade(&owned));
        Ok(channel)
    }

    /// Subscribe `callback` to `channels`. Channels this callback already
    /// listens on are skipped; the rest go out in one SUBSCRIBE.
    pub fn subscribe<F, I, B>(&self, callback: F, channels: I) -> Result<MessageCallback>
    where
        F: Fn(&Message) + Send + Sync + 'static,
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.subscribe_with(&callback, channels)?;
        Ok(callback)
    }

    /// Subscribe an existing callback, e.g. one returned by [`subscribe`](Self::subscribe)
    pub fn subscribe_with<I, B>(&self, callback: &MessageCallback, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names = channels.into_iter().map(Into::into).collect();
        self.inner
            .subscribe(Axis::Channel, Arc::clone(callback), names)
    }

    pub fn psubscribe<F, I, B>(&self, callback: F, patterns: I) -> Result<MessageCallback>
    where
        F: Fn(&Message) + Send + Sync + 'static,
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.psubscribe_with(&callback, patterns)?;
        Ok(callback)
    }

    pub fn psubscribe_with<I, B>(&self, callback: &MessageCallback, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names = patterns.into_iter().map(Into::into).collect();
        self.inner
            .subscribe(Axis::Pattern, Arc::clone(callback), names)
    }

    /// With no names, drop every channel subscription (pending and
    /// confirmed). Otherwise drop only the named ones.
    pub fn unsubscribe<I, B>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names = channels.into_iter().map(Into::into).collect();
        self.inner.unsubscribe(Axis::Channel, names)
    }

    pub fn punsubscribe<I, B>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let names = patterns.into_iter().map(Into::into).collect();
        self.inner.unsubscribe(Axis::Pattern, names)
    }

    /// Round trip a PING through the subscribed connection
    pub fn ping(&self, timeout: Duration) -> Result<()> {
        self.inner.ping(timeout)
    }

    /// Called when the receive loop ends, with the reason
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&ReceiveEnd) + Send + Sync + 'static,
    {
        *self.inner.on_end.lock() = Some(Arc::new(callback));
    }

    /// Open a fresh connection and resend every subscription, confirmed or
    /// still pending
    pub fn reconnect(&self) -> Result<()> {
        self.inner.reconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.is_running())
    }

    pub fn is_subscribed(&self, channel: &[u8]) -> bool {
        !self.inner.channels.subscribers(channel).is_empty()
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            channels: self.inner.channels.confirmed_count(),
            patterns: self.inner.patterns.confirmed_count(),
            pending_channels: self.inner.channels.pending_count(),
            pending_patterns: self.inner.patterns.pending_count(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn dispose(&self) {
        if let Some(probe) = &self.probe {
            self.runtime.cardio().detach(&Arc::downgrade(probe));
        }
        self.inner.dispose();
    }
}

impl OwnedChannel for PubSubChannel {
    fn dispose(&self) {
        PubSubChannel::dispose(self);
    }
}

impl Drop for PubSubChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}
