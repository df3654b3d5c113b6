//! In-process RESP server for integration tests.
//!
//! Understands enough of the protocol to exercise the client: strings,
//! counters, MULTI/EXEC with WATCH, pub/sub (channels and `prefix*`
//! patterns), MONITOR, plus a `SLEEP <ms>` command for slow replies.

#![allow(dead_code)]

use bytes::Bytes;
use feox_client::protocol::resp::{write_resp_value, RespParser, RespValue};
use feox_client::{Client, ClientRuntime, Config, RuntimeOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Writer = Arc<Mutex<TcpStream>>;

struct Subscriber {
    writer: Writer,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct State {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    versions: Mutex<HashMap<Vec<u8>, u64>>,
    subscribers: Mutex<HashMap<usize, Subscriber>>,
    monitors: Mutex<HashMap<usize, Writer>>,
    clients: Mutex<HashMap<usize, TcpStream>>,
    commands: Mutex<Vec<String>>,
    accepted: AtomicUsize,
    stopped: AtomicBool,
    message_before_ack: AtomicBool,
}

impl State {
    fn touch(&self, key: &[u8]) {
        *self.versions.lock().entry(key.to_vec()).or_default() += 1;
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.lock().get(key).copied().unwrap_or(0)
    }
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockServer {
    pub fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                if accept_state.stopped.load(Ordering::Acquire) {
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
                let id = accept_state.accepted.fetch_add(1, Ordering::AcqRel);
                if let Ok(clone) = stream.try_clone() {
                    accept_state.clients.lock().insert(id, clone);
                }
                let state = Arc::clone(&accept_state);
                thread::spawn(move || Session::new(id, stream, state).run());
            }
        });

        MockServer { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Sessions accepted so far
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::Acquire)
    }

    /// Upper-cased names of every command received, in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    pub fn count_commands(&self, name: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == name).count()
    }

    /// Abort every open session; the listener keeps accepting
    pub fn kill_clients(&self) {
        let clients: Vec<TcpStream> = self.state.clients.lock().drain().map(|(_, s)| s).collect();
        for client in clients {
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    /// Abort every session and refuse new ones
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        // Wake the accept loop so it notices
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(200));
        self.kill_clients();
    }

    /// Make SUBSCRIBE push an `early` message for each channel ahead of
    /// its acknowledgement
    pub fn message_before_ack(&self, on: bool) {
        self.state.message_before_ack.store(on, Ordering::Release);
    }

    pub fn set(&self, key: &str, value: &str) {
        self.state
            .data
            .lock()
            .insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
        self.state.touch(key.as_bytes());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Session {
    id: usize,
    stream: TcpStream,
    writer: Writer,
    peer: String,
    state: Arc<State>,
    multi: Option<Vec<Vec<Bytes>>>,
    watched: Vec<(Vec<u8>, u64)>,
    subscribed: bool,
}

impl Session {
    fn new(id: usize, stream: TcpStream, state: Arc<State>) -> Session {
        let writer = Arc::new(Mutex::new(stream.try_clone().expect("clone")));
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Session {
            id,
            stream,
            writer,
            peer,
            state,
            multi: None,
            watched: Vec::new(),
            subscribed: false,
        }
    }

    fn run(mut self) {
        let mut parser = RespParser::new();
        let mut buf = [0u8; 4096];
        'outer: loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            parser.feed(&buf[..n]);
            loop {
                match parser.parse_next() {
                    Ok(Some(RespValue::Array(Some(items)))) => {
                        let args: Vec<Bytes> = items
                            .into_iter()
                            .filter_map(|item| match item {
                                RespValue::BulkString(Some(b)) => Some(b),
                                _ => None,
                            })
                            .collect();
                        if args.is_empty() {
                            continue;
                        }
                        if let Some(reply) = self.handle(args) {
                            self.reply(&reply);
                        }
                    }
                    Ok(Some(_)) => {
                        self.reply(&error("ERR protocol error"));
                    }
                    Ok(None) => break,
                    Err(_) => break 'outer,
                }
            }
        }
        self.state.subscribers.lock().remove(&self.id);
        self.state.monitors.lock().remove(&self.id);
        self.state.clients.lock().remove(&self.id);
    }

    fn reply(&self, value: &RespValue) {
        let mut out = Vec::new();
        write_resp_value(&mut out, value);
        let mut writer = self.writer.lock();
        let _ = writer.write_all(&out);
        let _ = writer.flush();
    }

    fn handle(&mut self, args: Vec<Bytes>) -> Option<RespValue> {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        self.state.commands.lock().push(name.clone());
        if name != "MONITOR" {
            self.feed_monitors(&args);
        }

        if let Some(queued) = self.multi.as_mut() {
            match name.as_str() {
                "EXEC" | "DISCARD" | "MULTI" | "WATCH" => {}
                "BOGUS" => return Some(error("ERR unknown command 'BOGUS'")),
                _ => {
                    queued.push(args);
                    return Some(simple("QUEUED"));
                }
            }
        }

        let reply = match name.as_str() {
            "PING" if self.subscribed => array(vec![bulk(b"pong"), bulk(b"")]),
            "PING" => simple("PONG"),
            "ROLE" => array(vec![
                bulk(b"master"),
                RespValue::Integer(0),
                RespValue::Array(Some(Vec::new())),
            ]),
            "AUTH" | "SELECT" | "CLIENT" => ok(),
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                self.subscribe(&name, &args[1..]);
                return None;
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                self.unsubscribe(&name, &args[1..]);
                return None;
            }
            "MONITOR" => {
                self.state
                    .monitors
                    .lock()
                    .insert(self.id, Arc::clone(&self.writer));
                ok()
            }
            "MULTI" => {
                self.multi = Some(Vec::new());
                ok()
            }
            "WATCH" => {
                for key in &args[1..] {
                    self.watched.push((key.to_vec(), self.state.version(key)));
                }
                ok()
            }
            "DISCARD" => {
                self.multi = None;
                self.watched.clear();
                ok()
            }
            "EXEC" => {
                let queued = self.multi.take().unwrap_or_default();
                let watched = std::mem::take(&mut self.watched);
                let dirty = watched
                    .iter()
                    .any(|(key, version)| self.state.version(key) != *version);
                if dirty {
                    RespValue::Array(None)
                } else {
                    array(queued.into_iter().map(|c| self.execute(c)).collect())
                }
            }
            _ => self.execute(args),
        };
        Some(reply)
    }

    fn execute(&self, args: Vec<Bytes>) -> RespValue {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let state = &self.state;
        match (name.as_str(), args.len()) {
            ("SET", 3) => {
                state.data.lock().insert(args[1].to_vec(), args[2].to_vec());
                state.touch(&args[1]);
                ok()
            }
            ("GET", 2) => match state.data.lock().get(args[1].as_ref()) {
                Some(value) => bulk(value),
                None => RespValue::BulkString(None),
            },
            ("DEL", n) if n > 1 => {
                let mut data = state.data.lock();
                let removed = args[1..]
                    .iter()
                    .filter(|k| data.remove(k.as_ref()).is_some())
                    .count();
                drop(data);
                for key in &args[1..] {
                    state.touch(key);
                }
                RespValue::Integer(removed as i64)
            }
            ("EXISTS", 2) => {
                RespValue::Integer(state.data.lock().contains_key(args[1].as_ref()) as i64)
            }
            ("INCR", 2) => {
                let mut data = state.data.lock();
                let current = data
                    .get(args[1].as_ref())
                    .map(|v| String::from_utf8_lossy(v).parse::<i64>())
                    .unwrap_or(Ok(0));
                match current {
                    Ok(n) => {
                        data.insert(args[1].to_vec(), (n + 1).to_string().into_bytes());
                        drop(data);
                        state.touch(&args[1]);
                        RespValue::Integer(n + 1)
                    }
                    Err(_) => error("ERR value is not an integer or out of range"),
                }
            }
            ("MGET", n) if n > 1 => {
                let data = state.data.lock();
                array(
                    args[1..]
                        .iter()
                        .map(|k| match data.get(k.as_ref()) {
                            Some(v) => bulk(v),
                            None => RespValue::BulkString(None),
                        })
                        .collect(),
                )
            }
            ("ECHO", 2) => bulk(&args[1]),
            ("PUBLISH", 3) => RespValue::Integer(self.publish(&args[1], &args[2])),
            ("SLEEP", 2) => {
                let ms = String::from_utf8_lossy(&args[1]).parse().unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
                ok()
            }
            _ => error(&format!("ERR unknown command '{}'", name.to_lowercase())),
        }
    }

    fn subscribe(&mut self, verb: &str, names: &[Bytes]) {
        let mut subscribers = self.state.subscribers.lock();
        let entry = subscribers.entry(self.id).or_insert_with(|| Subscriber {
            writer: Arc::clone(&self.writer),
            channels: HashSet::new(),
            patterns: HashSet::new(),
        });
        let mut acks = Vec::new();
        for name in names {
            let set = if verb == "SUBSCRIBE" {
                &mut entry.channels
            } else {
                &mut entry.patterns
            };
            set.insert(name.to_vec());
            let count = (entry.channels.len() + entry.patterns.len()) as i64;
            acks.push(array(vec![
                bulk(verb.to_lowercase().as_bytes()),
                bulk(name),
                RespValue::Integer(count),
            ]));
        }
        drop(subscribers);
        self.subscribed = true;
        if verb == "SUBSCRIBE" && self.state.message_before_ack.load(Ordering::Acquire) {
            for name in names {
                self.reply(&array(vec![bulk(b"message"), bulk(name), bulk(b"early")]));
            }
        }
        for ack in acks {
            self.reply(&ack);
        }
    }

    fn unsubscribe(&mut self, verb: &str, names: &[Bytes]) {
        let mut subscribers = self.state.subscribers.lock();
        let mut acks = Vec::new();
        if let Some(entry) = subscribers.get_mut(&self.id) {
            let set = if verb == "UNSUBSCRIBE" {
                &mut entry.channels
            } else {
                &mut entry.patterns
            };
            let targets: Vec<Vec<u8>> = if names.is_empty() {
                set.drain().collect()
            } else {
                names.iter().map(|n| n.to_vec()).collect()
            };
            for target in targets {
                let set = if verb == "UNSUBSCRIBE" {
                    &mut entry.channels
                } else {
                    &mut entry.patterns
                };
                set.remove(&target);
                let count = (entry.channels.len() + entry.patterns.len()) as i64;
                acks.push(array(vec![
                    bulk(verb.to_lowercase().as_bytes()),
                    bulk(&target),
                    RespValue::Integer(count),
                ]));
            }
        }
        drop(subscribers);
        if acks.is_empty() {
            acks.push(array(vec![
                bulk(verb.to_lowercase().as_bytes()),
                RespValue::BulkString(None),
                RespValue::Integer(0),
            ]));
        }
        for ack in acks {
            self.reply(&ack);
        }
    }

    fn publish(&self, channel: &[u8], payload: &[u8]) -> i64 {
        let subscribers = self.state.subscribers.lock();
        let mut receivers = 0;
        for subscriber in subscribers.values() {
            let mut frames = Vec::new();
            if subscriber.channels.contains(channel) {
                frames.push(array(vec![bulk(b"message"), bulk(channel), bulk(payload)]));
            }
            for pattern in &subscriber.patterns {
                if glob_matches(pattern, channel) {
                    frames.push(array(vec![
                        bulk(b"pmessage"),
                        bulk(pattern),
                        bulk(channel),
                        bulk(payload),
                    ]));
                }
            }
            for frame in frames {
                receivers += 1;
                let mut out = Vec::new();
                write_resp_value(&mut out, &frame);
                let mut writer = subscriber.writer.lock();
                let _ = writer.write_all(&out);
                let _ = writer.flush();
            }
        }
        receivers
    }

    fn feed_monitors(&self, args: &[Bytes]) {
        let monitors: Vec<Writer> = self.state.monitors.lock().values().cloned().collect();
        if monitors.is_empty() {
            return;
        }
        let quoted: Vec<String> = args
            .iter()
            .map(|a| format!("\"{}\"", String::from_utf8_lossy(a).replace('"', "\\\"")))
            .collect();
        let line = format!("1700000000.000001 [0 {}] {}", self.peer, quoted.join(" "));
        let mut out = Vec::new();
        write_resp_value(&mut out, &RespValue::SimpleString(Bytes::from(line)));
        for monitor in monitors {
            let mut writer = monitor.lock();
            let _ = writer.write_all(&out);
            let _ = writer.flush();
        }
    }
}

fn glob_matches(pattern: &[u8], channel: &[u8]) -> bool {
    match pattern.strip_suffix(b"*") {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn ok() -> RespValue {
    simple("OK")
}

fn simple(s: &str) -> RespValue {
    RespValue::SimpleString(Bytes::copy_from_slice(s.as_bytes()))
}

fn error(s: &str) -> RespValue {
    RespValue::Error(s.to_string())
}

fn bulk(b: &[u8]) -> RespValue {
    RespValue::BulkString(Some(Bytes::copy_from_slice(b)))
}

fn array(items: Vec<RespValue>) -> RespValue {
    RespValue::Array(Some(items))
}

/// Test config: short timeouts, heartbeat off unless a test turns it on
pub fn config_for(server: &MockServer) -> Config {
    Config {
        endpoints: vec![server.endpoint()],
        max_connections: 4,
        connect_timeout_ms: 1_000,
        receive_timeout_ms: 2_000,
        wait_timeout_ms: 1_000,
        heartbeat_enabled: false,
        ..Default::default()
    }
}

/// Runtime private to one test
pub fn runtime() -> Arc<ClientRuntime> {
    ClientRuntime::new(RuntimeOptions {
        worker_threads: 4,
        purge_interval: Duration::from_millis(50),
        heartbeat_tick: Duration::from_millis(10),
    })
    .expect("runtime")
}

pub fn client_for(server: &MockServer) -> Client {
    Client::with_runtime(config_for(server), runtime()).expect("client")
}

/// Poll `check` until it holds or `timeout` passes
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
