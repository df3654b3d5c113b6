mod common;

use bytes::Bytes;
use common::{client_for, config_for, eventually, runtime, MockServer};
use feox_client::{
    Client, Command, ConnectionPool, ErrorCode, ExpectBulkString, ExpectTag, RedisValue, Role,
    TypedResult,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn expect_entry_points_project_replies() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert!(client
        .expect_ok(Command::new(0, "SET").arg("name").arg("feox"))
        .unwrap());
    assert_eq!(
        client
            .expect_bulk_string(Command::new(0, "GET").arg("name"))
            .unwrap()
            .as_deref(),
        Some("feox")
    );
    assert_eq!(
        client
            .expect_bulk_string_bytes(Command::new(0, "GET").arg("missing"))
            .unwrap(),
        None
    );
    assert_eq!(
        client
            .expect_integer(Command::new(0, "INCR").arg("hits"))
            .unwrap(),
        1
    );
    assert_eq!(
        client
            .expect_nullable_integer(Command::new(0, "GET").arg("hits"))
            .unwrap(),
        Some(1)
    );
    assert_eq!(
        client
            .expect_nullable_double(Command::new(0, "GET").arg("nope"))
            .unwrap(),
        None
    );
    assert_eq!(
        client
            .expect_double(Command::new(0, "ECHO").arg("3.25"))
            .unwrap(),
        3.25
    );
    assert!(client
        .expect_one(Command::new(0, "EXISTS").arg("name"))
        .unwrap());
    assert_eq!(
        client
            .expect_multi_data_strings(Command::new(0, "MGET").arg("name").arg("missing"))
            .unwrap(),
        vec![Some("feox".to_string()), None]
    );
    assert_eq!(
        client
            .expect_multi_data_bytes(Command::new(0, "GET").arg("name"))
            .unwrap(),
        vec![Some(Bytes::from_static(b"feox"))]
    );
    assert_eq!(
        client
            .expect_array(Command::new(0, "MGET").arg("name"))
            .unwrap(),
        Some(vec![RedisValue::Bytes(Bytes::from_static(b"feox"))])
    );
    assert_eq!(
        client
            .expect_simple_string(Command::new(0, "PING"))
            .unwrap(),
        "PONG"
    );
    assert_eq!(
        client
            .expect_simple_string_bytes(Command::new(0, "PING"))
            .unwrap(),
        Bytes::from_static(b"PONG")
    );
    assert!(client
        .expect_greater_than_zero(Command::new(0, "DEL").arg("name").arg("hits"))
        .unwrap());
    client.expect_nothing(Command::new(0, "PING")).unwrap();
}

#[test]
fn tagged_execution_matches_generic_execution() {
    let server = MockServer::start();
    server.set("k", "v");
    let client = client_for(&server);

    let tagged = client
        .execute_tagged(ExpectTag::BulkString, Command::new(0, "GET").arg("k"))
        .unwrap();
    assert_eq!(tagged, TypedResult::String(Some("v".to_string())));

    let generic = client
        .execute::<ExpectBulkString>(Command::new(0, "GET").arg("k"))
        .unwrap();
    assert_eq!(generic.as_deref(), Some("v"));
}

#[test]
fn server_errors_keep_the_connection() {
    let server = MockServer::start();
    let client = client_for(&server);

    let err = client
        .expect_ok(Command::new(0, "NOSUCHCOMMAND"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerError);
    assert_eq!(err.server_prefix(), Some("ERR"));
    assert!(!err.is_fatal());

    // Same session serves the next request
    client.expect_simple_string(Command::new(0, "PING")).unwrap();
    let stats = client.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.discarded, 0);
}

#[test]
fn suppressed_errors_return_the_default() {
    let server = MockServer::start();
    let client = client_for(&server);

    let value = client
        .expect_integer(Command::new(0, "NOSUCHCOMMAND").suppress_errors())
        .unwrap();
    assert_eq!(value, 0);
    let value = client
        .expect_bulk_string(Command::new(0, "PING").suppress_errors())
        .unwrap();
    assert_eq!(value, Some("PONG".to_string()));
}

#[test]
fn empty_command_fails_before_any_io() {
    let server = MockServer::start();
    let client = client_for(&server);

    let err = client.expect_ok(Command::new(0, "")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingParameter);
    assert_eq!(client.stats().created, 0);
    assert_eq!(server.accepted(), 0);
}

#[test]
fn acquire_blocks_until_a_connection_is_released() {
    let server = MockServer::start();
    let config = feox_client::Config {
        max_connections: 2,
        ..config_for(&server)
    };
    let pool = Arc::new(ConnectionPool::new(&config, runtime()).unwrap());

    let first = pool.acquire(0, Role::Any).unwrap();
    let second = pool.acquire(0, Role::Any).unwrap();
    assert_eq!(pool.in_use_count(), 2);
    assert_eq!(pool.available_count(), 0);
    assert_eq!(pool.in_use_count() + pool.available_count(), pool.max_connections());

    assert!(pool
        .acquire_timeout(0, Role::Any, Duration::from_millis(50))
        .unwrap()
        .is_none());

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(first);
    });

    let started = Instant::now();
    let third = pool
        .acquire_timeout(0, Role::Any, Duration::from_secs(2))
        .unwrap()
        .expect("released slot");
    assert!(started.elapsed() >= Duration::from_millis(50));
    releaser.join().unwrap();

    // The released session was reused rather than reopened
    assert_eq!(pool.stats().created, 2);
    drop(second);
    drop(third);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.idle_count(), 2);
}

#[test]
fn concurrent_acquires_beyond_the_limit_wait_their_turn() {
    let server = MockServer::start();
    let config = feox_client::Config {
        max_connections: 2,
        wait_timeout_ms: 2_000,
        ..config_for(&server)
    };
    let pool = Arc::new(ConnectionPool::new(&config, runtime()).unwrap());
    let barrier = Arc::new(std::sync::Barrier::new(3));

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let started = Instant::now();
                let conn = pool.acquire(0, Role::Any).unwrap();
                assert!(pool.in_use_count() <= 2);
                thread::sleep(Duration::from_millis(100));
                drop(conn);
                started.elapsed()
            })
        })
        .collect();
    let waits: Vec<Duration> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Two got a slot straight away, the third waited for a release
    assert_eq!(
        waits
            .iter()
            .filter(|w| **w >= Duration::from_millis(180))
            .count(),
        1
    );
    assert!(pool.stats().created <= 2);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.available_count(), 2);
}

#[test]
fn purge_leaves_held_connections_alone() {
    let server = MockServer::start();
    let config = feox_client::Config {
        idle_timeout_ms: 20,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    let mut held = client.pool().acquire(0, Role::Any).unwrap();
    let held_id = held.id();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(client.pool().purge(), 0);

    // Still the same live session after several purge sweeps
    assert_eq!(held.id(), held_id);
    assert!(held.is_usable());
    assert_eq!(
        held.send_receive(&Command::new(0, "PING")).unwrap(),
        feox_client::protocol::RespValue::SimpleString(Bytes::from_static(b"PONG"))
    );
    drop(held);
    assert_eq!(client.stats().created, 1);
}

#[test]
fn acquire_timeout_is_a_timeout_error() {
    let server = MockServer::start();
    let config = feox_client::Config {
        max_connections: 1,
        wait_timeout_ms: 30,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    let _held = client.pool().acquire(0, Role::Any).unwrap();
    let err = client.expect_simple_string(Command::new(0, "PING")).unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn idle_connections_are_purged() {
    let server = MockServer::start();
    let config = feox_client::Config {
        idle_timeout_ms: 100,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    client.expect_simple_string(Command::new(0, "PING")).unwrap();
    assert_eq!(client.pool().idle_count(), 1);

    // The shared purger sweeps every 50ms
    assert!(eventually(Duration::from_secs(2), || client
        .pool()
        .idle_count()
        == 0));
    assert_eq!(client.pool().purge(), 0);
}

#[test]
fn dead_idle_connection_is_replaced() {
    let server = MockServer::start();
    let client = client_for(&server);

    client.expect_simple_string(Command::new(0, "PING")).unwrap();
    server.kill_clients();
    thread::sleep(Duration::from_millis(50));

    client.expect_simple_string(Command::new(0, "PING")).unwrap();
    assert_eq!(client.stats().created, 2);
}

#[test]
fn fire_and_forget_discards_the_session() {
    let server = MockServer::start();
    let client = client_for(&server);

    // Nothing is read back, so the shape's default comes back
    let ok = client
        .expect_ok(Command::new(0, "SET").arg("k").arg("v").fire_and_forget())
        .unwrap();
    assert!(!ok);
    assert!(eventually(Duration::from_secs(1), || server
        .count_commands("SET")
        == 1));
    assert_eq!(client.stats().discarded, 1);
    assert_eq!(client.pool().idle_count(), 0);
}

#[test]
fn fire_and_forget_skips_the_projection() {
    let server = MockServer::start();
    let client = client_for(&server);

    let n = client
        .expect_integer(Command::new(0, "INCR").arg("hits").fire_and_forget())
        .unwrap();
    assert_eq!(n, 0);
    let tagged = client
        .execute_tagged(
            ExpectTag::Integer,
            Command::new(0, "INCR").arg("hits").fire_and_forget(),
        )
        .unwrap();
    assert_eq!(tagged, TypedResult::Integer(0));

    assert!(eventually(Duration::from_secs(1), || server
        .count_commands("INCR")
        == 2));
    assert_eq!(
        client
            .expect_integer(Command::new(0, "INCR").arg("hits"))
            .unwrap(),
        3
    );
}

#[test]
fn disposed_pool_rejects_work() {
    let server = MockServer::start();
    let client = client_for(&server);
    client.expect_simple_string(Command::new(0, "PING")).unwrap();

    client.dispose();
    assert!(client.is_disposed());
    assert_eq!(client.pool().idle_count(), 0);

    let err = client
        .expect_simple_string(Command::new(0, "PING"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectDisposed);

    let mut pipeline = client.pipeline();
    let _ = pipeline
        .add::<feox_client::ExpectOk>(Command::new(0, "PING"))
        .unwrap();
    let err = client.run_pipeline(pipeline).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ObjectDisposed);
}

#[test]
fn refused_endpoint_surfaces_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = feox_client::Config {
        endpoints: vec![addr.to_string()],
        heartbeat_enabled: false,
        ..Default::default()
    };
    let client = Client::with_runtime(config, runtime()).unwrap();
    let err = client
        .expect_simple_string(Command::new(0, "PING"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailure);
    assert!(err.is_fatal());
    assert_eq!(client.pool().in_use_count(), 0);
}
