//! MONITOR stream
//!
//! A [`MonitorChannel`] puts a dedicated connection into MONITOR mode and
//! hands every command the server reports to a callback, in order.

use crate::error::{ConnectionErrorKind, Error, Result};
use crate::heartbeat::Probe;
use crate::network::{frame_bytes, ReceiveEnd, ReceiveHandle};
use crate::pool::{ConnectionPool, OwnedChannel};
use crate::protocol::{Command, ExpectOk, Expectation};
use crate::runtime::mailbox::{Handler, Mailbox};
use crate::runtime::ClientRuntime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// One line of MONITOR output, e.g.
/// `1339518083.107412 [0 127.0.0.1:60866] "keys" "*"`
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorMessage {
    /// Server time in seconds since the epoch
    pub time: f64,
    pub db: u32,
    /// `ip:port`, `lua` or `unix:/path`
    pub client: String,
    /// Command and arguments, unquoted
    pub args: Vec<String>,
    pub raw: String,
}

impl MonitorMessage {
    pub fn parse(line: &str) -> Result<MonitorMessage> {
        let corrupt = || Error::corrupt(format!("malformed MONITOR line '{}'", line));

        let (time, rest) = line.split_once(' ').ok_or_else(corrupt)?;
        let time: f64 = time.parse().map_err(|_| corrupt())?;

        let rest = rest.trim_start();
        let rest = rest.strip_prefix('[').ok_or_else(corrupt)?;
        let (origin, command) = rest.split_once(']').ok_or_else(corrupt)?;
        let (db, client) = origin.split_once(' ').ok_or_else(corrupt)?;
        let db: u32 = db.parse().map_err(|_| corrupt())?;

        Ok(MonitorMessage {
            time,
            db,
            client: client.to_string(),
            args: unquote_args(command.trim()).ok_or_else(corrupt)?,
            raw: line.to_string(),
        })
    }

    pub fn command(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// Split `"set" "k" "v\"x"` into its unescaped arguments
fn unquote_args(text: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => return Some(args),
            Some('"') => {}
            Some(_) => return None,
        }

        // Escapes decode to raw bytes; multi-byte UTF-8 arrives as several \x pairs
        let mut arg: Vec<u8> = Vec::new();
        let mut utf8 = [0u8; 4];
        loop {
            match chars.next()? {
                '"' => break,
                '\\' => match chars.next()? {
                    'n' => arg.push(b'\n'),
                    'r' => arg.push(b'\r'),
                    't' => arg.push(b'\t'),
                    'a' => arg.push(0x07),
                    'b' => arg.push(0x08),
                    'x' => {
                        let hex: String = [chars.next()?, chars.next()?].iter().collect();
                        arg.push(u8::from_str_radix(&hex, 16).ok()?);
                    }
                    other => arg.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes()),
                },
                c => arg.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes()),
            }
        }
        args.push(String::from_utf8_lossy(&arg).into_owned());
    }
}

struct MonitorInner {
    name: String,
    handle: Mutex<Option<ReceiveHandle>>,
    received: AtomicU64,
}

struct MonitorProbe(Weak<MonitorInner>);

impl Probe for MonitorProbe {
    fn probe_name(&self) -> String {
        self.0
            .upgrade()
            .map(|inner| inner.name.clone())
            .unwrap_or_else(|| "disposed monitor".to_string())
    }

    /// The stream cannot carry a PING, so liveness is the receive loop itself
    fn pulse(&self, _timeout: Duration) -> Result<()> {
        let inner = self.0.upgrade().ok_or(Error::ObjectDisposed("monitor"))?;
        let running = inner.handle.lock().as_ref().is_some_and(|h| h.is_running());
        if running {
            Ok(())
        } else {
            Err(Error::connection(
                ConnectionErrorKind::Closed,
                format!("{} is no longer streaming", inner.name),
            ))
        }
    }
}

pub struct MonitorChannel {
    inner: Arc<MonitorInner>,
    runtime: Arc<ClientRuntime>,
    probe: Option<Arc<dyn Probe>>,
}

impl MonitorChannel {
    /// Start monitoring; `callback` runs on the shared executor for every
    /// reported command
    pub fn open<F>(pool: &ConnectionPool, callback: F) -> Result<Arc<Self>>
    where
        F: Fn(&MonitorMessage) + Send + Sync + 'static,
    {
        let mut conn = (pool.connector())()?;
        ExpectOk::project(conn.send_receive(&Command::new(0, "MONITOR"))?, true)?;

        let inner = Arc::new(MonitorInner {
            name: format!("monitor[{}]", pool.name()),
            handle: Mutex::new(None),
            received: AtomicU64::new(0),
        });

        let runtime = Arc::clone(pool.runtime());
        let executor = Arc::clone(runtime.executor());
        let mailbox = Mailbox::new(Arc::new(callback) as Handler<MonitorMessage>);
        let counter = Arc::downgrade(&inner);
        let name = inner.name.clone();

        let handle = conn.into_receiver(
            move |frame| {
                let line = match frame_bytes(&frame) {
                    Some(line) => String::from_utf8_lossy(line).into_owned(),
                    None => {
                        warn!("{} ignored a {} frame", name, frame.kind());
                        return;
                    }
                };
                match MonitorMessage::parse(&line) {
                    Ok(message) => {
                        if let Some(inner) = counter.upgrade() {
                            inner.received.fetch_add(1, Ordering::Relaxed);
                        }
                        mailbox.deliver(message, &executor);
                    }
                    Err(e) => warn!("{}: {}", name, e),
                }
            },
            |end| match end {
                ReceiveEnd::Faulted(e) => warn!("Monitor stream faulted: {}", e),
                other => debug!("Monitor stream ended: {:?}", other),
            },
        )?;
        *inner.handle.lock() = Some(handle);

        let probe = pool.heartbeat().map(|(interval, probe_timeout)| {
            let probe: Arc<dyn Probe> = Arc::new(MonitorProbe(Arc::downgrade(&inner)));
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
        debug!("{} started", channel.inner.name);
        Ok(channel)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.is_running())
    }

    /// Lines received so far
    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    pub fn dispose(&self) {
        if let Some(probe) = &self.probe {
            self.runtime.cardio().detach(&Arc::downgrade(probe));
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop();
            debug!("{} stopped", self.inner.name);
        }
    }
}

impl OwnedChannel for MonitorChannel {
    fn dispose(&self) {
        MonitorChannel::dispose(self);
    }
}

impl Drop for MonitorChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_client_line() {
        let m = MonitorMessage::parse(r#"1339518083.107412 [0 127.0.0.1:60866] "keys" "*""#)
            .unwrap();
        assert_eq!(m.db, 0);
        assert_eq!(m.client, "127.0.0.1:60866");
        assert_eq!(m.command(), Some("keys"));
        assert_eq!(m.args, vec!["keys", "*"]);
        assert!((m.time - 1339518083.107412).abs() < 1e-6);
    }

    #[test]
    fn unescapes_arguments() {
        let m = MonitorMessage::parse(r#"1.5 [3 lua] "set" "k" "a\"b\x41\n""#).unwrap();
        assert_eq!(m.db, 3);
        assert_eq!(m.client, "lua");
        assert_eq!(m.args, vec!["set", "k", "a\"bA\n"]);
    }

    #[test]
    fn hex_escapes_rebuild_multibyte_text() {
        let m = MonitorMessage::parse(r#"1.5 [0 127.0.0.1:1] "set" "caf\xc3\xa9" "\xff""#).unwrap();
        assert_eq!(m.args[1], "caf\u{e9}");
        assert_eq!(m.args[2], "\u{fffd}");
    }

    #[test]
    fn rejects_garbage() {
        assert!(MonitorMessage::parse("OK").is_err());
        assert!(MonitorMessage::parse("1.0 0 127.0.0.1 \"get\"").is_err());
        assert!(MonitorMessage::parse(r#"1.0 [0 x] get"#).is_err());
    }
}
