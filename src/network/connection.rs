use crate::config::Config;
use crate::error::{ConnectionErrorKind, Error, Result};
use crate::protocol::expect::{ExpectOk, Expectation};
use crate::protocol::resp::{encode_command, RespParser, RespValue};
use crate::protocol::{Command, Role};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Read timeout used while streaming so the loop can notice a stop request
const RECEIVE_POLL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Transport settings shared by every connection of a pool
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub send_timeout: Option<Duration>,
    pub receive_timeout: Duration,
    pub password: Option<String>,
    pub client_name: Option<String>,
    pub resolve_role: bool,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            receive_timeout: config.receive_timeout(),
            password: config.password.clone(),
            client_name: config.client_name.clone(),
            resolve_role: config.resolve_roles,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a continuous-receive loop ended
#[derive(Debug)]
pub enum ReceiveEnd {
    /// `stop` was requested
    Stopped,
    /// The server closed the session
    Closed,
    Faulted(Error),
}

/// A single client session with one server
pub struct Connection {
    id: usize,
    endpoint: SocketAddr,
    stream: TcpStream,
    parser: RespParser,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    db: u32,
    role: Role,
    state: ConnectionState,
    faulted: bool,
    receive_timeout: Duration,
    created_at: Instant,
    pooled_since: Option<Instant>,
    pulse_fail_count: u32,
}

impl Connection {
    /// Open a session, authenticate, select `db` and resolve the server role
    pub fn connect(endpoint: SocketAddr, db: u32, settings: &ConnectionSettings) -> Result<Self> {
        static CONNECTION_ID: AtomicUsize = AtomicUsize::new(0);
        let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        trace!("Connection {} connecting to {}", id, endpoint);
        let stream = TcpStream::connect_timeout(&endpoint, settings.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(settings.receive_timeout))?;
        stream.set_write_timeout(settings.send_timeout)?;

        let mut conn = Self {
            id,
            endpoint,
            stream,
            parser: RespParser::new(),
            read_buf: vec![0u8; READ_CHUNK],
            write_buf: Vec::with_capacity(256),
            db: 0,
            role: Role::Unknown,
            state: ConnectionState::Connecting,
            faulted: false,
            receive_timeout: settings.receive_timeout,
            created_at: Instant::now(),
            pooled_since: None,
            pulse_fail_count: 0,
        };

        conn.handshake(db, settings)?;
        conn.state = ConnectionState::Connected;

        debug!(
            "Connection {} established to {} (db {}, role {})",
            conn.id, conn.endpoint, conn.db, conn.role
        );
        Ok(conn)
    }

    fn handshake(&mut self, db: u32, settings: &ConnectionSettings) -> Result<()> {
        if let Some(password) = &settings.password {
            let cmd = Command::new(0, "AUTH").arg(password.clone());
            ExpectOk::project(self.round_trip(&cmd)?, true)?;
        }

        if let Some(name) = &settings.client_name {
            let cmd = Command::new(0, "CLIENT").arg("SETNAME").arg(name.clone());
            ExpectOk::project(self.round_trip(&cmd)?, true)?;
        }

        if db != 0 {
            let cmd = Command::new(db, "SELECT").int_arg(db as i64);
            ExpectOk::project(self.round_trip(&cmd)?, true)?;
        }
        self.db = db;

        if settings.resolve_role {
            self.role = match self.round_trip(&Command::new(db, "ROLE"))? {
                RespValue::Array(Some(items)) => match items.first() {
                    Some(RespValue::BulkString(Some(name))) | Some(RespValue::SimpleString(name)) => {
                        Role::from_name(name)
                    }
                    _ => Role::Unknown,
                },
                // Servers without ROLE answer with an error; the session is still fine
                _ => Role::Unknown,
            };
        }

        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pooled_since(&self) -> Option<Instant> {
        self.pooled_since
    }

    pub(crate) fn set_pooled_since(&mut self, at: Option<Instant>) {
        self.pooled_since = at;
    }

    pub fn pulse_fail_count(&self) -> u32 {
        self.pulse_fail_count
    }

    /// Connected and never saw a wire or transport fault
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected && !self.faulted
    }

    /// Fire-and-forget: write the command without reading a reply
    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        cmd.validate()?;
        self.ensure_connected()?;
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        self.flush_writes()
    }

    /// Blocking round trip
    pub fn send_receive(&mut self, cmd: &Command) -> Result<RespValue> {
        cmd.validate()?;
        self.ensure_connected()?;
        self.round_trip(cmd)
    }

    /// Write all commands in one go, then read one reply per command in order
    pub fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<RespValue>> {
        for cmd in cmds {
            cmd.validate()?;
        }
        self.ensure_connected()?;

        self.write_buf.clear();
        for cmd in cmds {
            encode_command(cmd, &mut self.write_buf);
        }
        self.flush_writes()?;

        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            replies.push(self.read_frame()?);
        }
        Ok(replies)
    }

    /// PING with its own read timeout, used by heartbeat probes
    pub fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        self.stream.set_read_timeout(Some(timeout))?;
        let reply = self.round_trip(&Command::new(self.db, "PING"));
        if self.is_usable() {
            self.stream.set_read_timeout(Some(self.receive_timeout))?;
        }
        let result = match reply? {
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case(b"PONG") => Ok(()),
            RespValue::Error(message) => Err(Error::Server(message)),
            other => Err(Error::corrupt(format!(
                "expected PONG, got {}",
                other.kind()
            ))),
        };
        match &result {
            Ok(()) => self.pulse_fail_count = 0,
            Err(_) => self.pulse_fail_count += 1,
        }
        result
    }

    /// Cheap liveness check: a non-blocking peek, no round trip.
    ///
    /// Pending unsolicited bytes count as dead since the session is out of
    /// step with its replies.
    pub fn is_alive(&self) -> bool {
        if !self.is_usable() || self.parser.has_partial() {
            return false;
        }
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match self.stream.peek(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        };
        alive && self.stream.set_nonblocking(false).is_ok()
    }

    /// Read one complete reply, blocking up to the receive timeout per read
    pub fn read_frame(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = self.parse_buffered()? {
                return Ok(value);
            }
            if !self.fill()? {
                return Err(self.fault(Error::timeout(format!(
                    "no reply from {} within {:?}",
                    self.endpoint, self.receive_timeout
                ))));
            }
        }
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.state = ConnectionState::Closed;
            debug!("Connection {} to {} closed", self.id, self.endpoint);
        }
    }

    /// Switch to continuous-receive mode.
    ///
    /// A dedicated thread reads frames and hands each to `on_frame` until
    /// stopped or the session faults, then calls `on_end` once. The returned
    /// handle keeps a write half for sending further commands.
    pub fn into_receiver<F, G>(mut self, mut on_frame: F, on_end: G) -> Result<ReceiveHandle>
    where
        F: FnMut(RespValue) + Send + 'static,
        G: FnOnce(ReceiveEnd) + Send + 'static,
    {
        self.ensure_connected()?;
        let writer = self.stream.try_clone()?;
        self.stream.set_read_timeout(Some(RECEIVE_POLL))?;

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let id = self.id;
        let endpoint = self.endpoint;
        let db = self.db;

        let thread_stop = Arc::clone(&stop);
        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(format!("feox-recv-{}", id))
            .spawn(move || {
                let end = self.receive_loop(&thread_stop, &mut on_frame);
                self.close();
                thread_running.store(false, Ordering::Release);
                on_end(end);
            })?;

        Ok(ReceiveHandle {
            id,
            endpoint,
            db,
            writer: Mutex::new(writer),
            stop,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn receive_loop<F>(&mut self, stop: &AtomicBool, on_frame: &mut F) -> ReceiveEnd
    where
        F: FnMut(RespValue),
    {
        while !stop.load(Ordering::Acquire) {
            match self.parse_buffered() {
                Ok(Some(frame)) => {
                    on_frame(frame);
                    continue;
                }
                Ok(None) => {}
                Err(e) => return ReceiveEnd::Faulted(e),
            }
            match self.fill() {
                Ok(_) => {}
                Err(_) if stop.load(Ordering::Acquire) => break,
                Err(Error::Connection {
                    kind: ConnectionErrorKind::Closed,
                    ..
                }) => return ReceiveEnd::Closed,
                Err(e) => return ReceiveEnd::Faulted(e),
            }
        }
        ReceiveEnd::Stopped
    }

    fn round_trip(&mut self, cmd: &Command) -> Result<RespValue> {
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        self.flush_writes()?;
        self.read_frame()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_usable() || self.state == ConnectionState::Connecting {
            Ok(())
        } else {
            Err(Error::connection(
                ConnectionErrorKind::Closed,
                format!("connection {} to {} is not usable", self.id, self.endpoint),
            ))
        }
    }

    fn flush_writes(&mut self) -> Result<()> {
        let result = self
            .stream
            .write_all(&self.write_buf)
            .and_then(|_| self.stream.flush());
        result.map_err(|e| self.fault(e.into()))
    }

    fn parse_buffered(&mut self) -> Result<Option<RespValue>> {
        self.parser.parse_next().map_err(|e| self.fault(e))
    }

    /// One read from the socket. `Ok(false)` means the read timed out.
    fn fill(&mut self) -> Result<bool> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    let err = if self.parser.has_partial() {
                        Error::corrupt(format!(
                            "connection to {} closed in the middle of a frame",
                            self.endpoint
                        ))
                    } else {
                        Error::connection(
                            ConnectionErrorKind::Closed,
                            format!("connection to {} closed by server", self.endpoint),
                        )
                    };
                    return Err(self.fault(err));
                }
                Ok(n) => {
                    self.parser.feed(&self.read_buf[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(false)
                }
                Err(e) => return Err(self.fault(e.into())),
            }
        }
    }

    fn fault(&mut self, err: Error) -> Error {
        if !self.faulted {
            self.faulted = true;
            warn!(
                "Connection {} to {} faulted: {}",
                self.id, self.endpoint, err
            );
        }
        self.parser.reset();
        err
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle of a connection in continuous-receive mode
pub struct ReceiveHandle {
    id: usize,
    endpoint: SocketAddr,
    db: u32,
    writer: Mutex<TcpStream>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiveHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Write one command on the streaming session
    pub fn send(&self, cmd: &Command) -> Result<()> {
        cmd.validate()?;
        if !self.is_running() {
            return Err(Error::connection(
                ConnectionErrorKind::Closed,
                format!("receive loop on {} has ended", self.endpoint),
            ));
        }
        let mut frame = Vec::with_capacity(64);
        encode_command(cmd, &mut frame);
        // The lock only serialises frames on this socket's write half
        let mut writer = self.writer.lock();
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Request the loop to end and wait for it
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Read);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for ReceiveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame payload as bytes when it is a simple or bulk string
pub(crate) fn frame_bytes(value: &RespValue) -> Option<&Bytes> {
    match value {
        RespValue::SimpleString(b) | RespValue::BulkString(Some(b)) => Some(b),
        _ => None,
    }
}
