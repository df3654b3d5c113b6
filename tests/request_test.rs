mod common;

use bytes::Bytes;
use common::{client_for, config_for, runtime, MockServer};
use feox_client::{
    Client, ClientRuntime, Command, Config, ErrorCode, ExpectBulkString, ExpectInteger, ExpectOk,
    ExpectSimpleString, RequestState, Role, RuntimeOptions,
};
use std::thread;
use std::time::Duration;

#[test]
fn async_execution_completes_the_future() {
    let server = MockServer::start();
    server.set("k", "v");
    let client = client_for(&server);

    let future = client
        .execute_async::<ExpectBulkString>(Command::new(0, "GET").arg("k"))
        .unwrap();
    let value = future.wait_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(value.as_deref(), Some("v"));
}

#[test]
fn async_overflow_is_queued_until_a_slot_frees() {
    let server = MockServer::start();
    let config = Config {
        max_connections: 1,
        async_completion: true,
        async_timeout_ms: 2_000,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    let held = client.pool().acquire(0, Role::Any).unwrap();
    let future = client
        .execute_async::<ExpectInteger>(Command::new(0, "INCR").arg("n"))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!future.is_ready());

    drop(held);
    assert_eq!(future.wait_timeout(Duration::from_secs(2)).unwrap(), 1);
}

#[test]
fn waiting_async_request_leaves_the_workers_free() {
    let server = MockServer::start();
    let runtime = ClientRuntime::new(RuntimeOptions {
        worker_threads: 1,
        purge_interval: Duration::from_millis(50),
        heartbeat_tick: Duration::from_millis(10),
    })
    .unwrap();
    let config = Config {
        max_connections: 1,
        wait_timeout_ms: 500,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime).unwrap();

    let held = client.pool().acquire(0, Role::Any).unwrap();
    let first = client
        .execute_async::<ExpectSimpleString>(Command::new(0, "PING"))
        .unwrap();
    drop(held);
    let second = client
        .execute_async::<ExpectSimpleString>(Command::new(0, "PING"))
        .unwrap();

    assert_eq!(first.wait_timeout(Duration::from_secs(2)).unwrap(), "PONG");
    assert_eq!(second.wait_timeout(Duration::from_secs(2)).unwrap(), "PONG");
    assert_eq!(client.pool().queued_count(), 0);
}

#[test]
fn blocking_execute_falls_back_to_the_queue() {
    let server = MockServer::start();
    let config = Config {
        max_connections: 1,
        wait_timeout_ms: 20,
        async_completion: true,
        async_timeout_ms: 2_000,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    let held = client.pool().acquire(0, Role::Any).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    let reply = client.expect_simple_string(Command::new(0, "PING")).unwrap();
    assert_eq!(reply, "PONG");
    releaser.join().unwrap();
}

#[test]
fn queued_request_expires() {
    let server = MockServer::start();
    let config = Config {
        max_connections: 1,
        wait_timeout_ms: 10,
        async_completion: true,
        async_timeout_ms: 150,
        ..config_for(&server)
    };
    let client = Client::with_runtime(config, runtime()).unwrap();

    let _held = client.pool().acquire(0, Role::Any).unwrap();
    let future = client
        .execute_async::<ExpectOk>(Command::new(0, "SET").arg("k").arg("v"))
        .unwrap();
    let err = future.wait_timeout(Duration::from_secs(2)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(server.count_commands("SET"), 0);
}

#[test]
fn pipeline_settles_every_future_in_order() {
    let server = MockServer::start();
    let client = client_for(&server);

    let mut pipeline = client.pipeline();
    let set = pipeline
        .add::<ExpectOk>(Command::new(0, "SET").arg("a").arg("1"))
        .unwrap();
    let incr = pipeline
        .add::<ExpectInteger>(Command::new(0, "INCR").arg("a"))
        .unwrap();
    let get = pipeline
        .add::<ExpectBulkString>(Command::new(0, "GET").arg("a"))
        .unwrap();
    let bad = pipeline
        .add::<ExpectInteger>(Command::new(0, "BOGUS"))
        .unwrap();
    assert_eq!(pipeline.len(), 4);
    client.run_pipeline(pipeline).unwrap();

    assert!(set.wait().unwrap());
    assert_eq!(incr.wait().unwrap(), 2);
    assert_eq!(get.wait().unwrap().as_deref(), Some("2"));
    assert_eq!(bad.wait().unwrap_err().code(), ErrorCode::ServerError);

    // One session carried the whole batch
    assert_eq!(client.stats().created, 1);
}

#[test]
fn batches_stay_on_one_database() {
    let server = MockServer::start();
    let client = client_for(&server);

    let mut pipeline = client.pipeline();
    pipeline
        .add::<ExpectOk>(Command::new(0, "SET").arg("a").arg("1"))
        .unwrap();
    let err = pipeline
        .add::<ExpectOk>(Command::new(3, "SET").arg("a").arg("2"))
        .err()
        .expect("db 3 command in a db 0 pipeline");
    assert_eq!(err.code(), ErrorCode::MissingParameter);
    assert_eq!(pipeline.len(), 1);

    let mut tx = client.transaction(0, &[]).unwrap();
    let err = tx
        .add::<ExpectInteger>(Command::new(2, "INCR").arg("a"))
        .err()
        .expect("db 2 command in a db 0 transaction");
    assert_eq!(err.code(), ErrorCode::MissingParameter);
    assert!(tx.is_empty());
    tx.discard().unwrap();
    assert_eq!(server.count_commands("INCR"), 0);
}

#[test]
fn dropped_pipeline_cancels_its_futures() {
    let client_side = {
        let mut pipeline = feox_client::Pipeline::new();
        let future = pipeline
            .add::<ExpectOk>(Command::new(0, "SET").arg("a").arg("1"))
            .unwrap();
        drop(pipeline);
        future
    };
    assert_eq!(client_side.state(), RequestState::Canceled);
    assert_eq!(client_side.wait().unwrap_err().code(), ErrorCode::Canceled);
}

#[test]
fn transaction_values_materialise_after_exec() {
    let server = MockServer::start();
    let client = client_for(&server);

    let mut tx = client.transaction(0, &[]).unwrap();
    let set = tx
        .add::<ExpectOk>(Command::new(0, "SET").arg("k").arg("10"))
        .unwrap();
    let incr = tx.add::<ExpectInteger>(Command::new(0, "INCR").arg("k")).unwrap();
    assert!(!incr.is_ready());
    assert_eq!(incr.state(), RequestState::Initiated);

    assert!(tx.exec().unwrap());
    assert!(set.wait().unwrap());
    assert_eq!(incr.wait().unwrap(), 11);
}

#[test]
fn watched_key_change_aborts_the_transaction() {
    let server = MockServer::start();
    server.set("balance", "100");
    let client = client_for(&server);

    let mut tx = client
        .transaction(0, &[Bytes::from_static(b"balance")])
        .unwrap();
    let incr = tx
        .add::<ExpectInteger>(Command::new(0, "INCR").arg("balance"))
        .unwrap();

    // Another session writes the watched key before EXEC
    client
        .expect_ok(Command::new(0, "SET").arg("balance").arg("5"))
        .unwrap();

    assert!(!tx.exec().unwrap());
    assert_eq!(incr.state(), RequestState::Canceled);
    assert_eq!(incr.wait().unwrap_err().code(), ErrorCode::Canceled);
    assert_eq!(
        client
            .expect_bulk_string(Command::new(0, "GET").arg("balance"))
            .unwrap()
            .as_deref(),
        Some("5")
    );
}

#[test]
fn queue_rejection_and_discard() {
    let server = MockServer::start();
    let client = client_for(&server);

    let mut tx = client.transaction(0, &[]).unwrap();
    let set = tx
        .add::<ExpectOk>(Command::new(0, "SET").arg("k").arg("v"))
        .unwrap();
    let err = tx.add::<ExpectOk>(Command::new(0, "BOGUS")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerError);
    assert_eq!(tx.len(), 1);

    tx.discard().unwrap();
    assert_eq!(set.wait().unwrap_err().code(), ErrorCode::Canceled);
    assert_eq!(server.count_commands("DISCARD"), 1);
    assert_eq!(
        client
            .expect_bulk_string(Command::new(0, "GET").arg("k"))
            .unwrap(),
        None
    );
}

#[test]
fn dropping_an_open_transaction_sends_discard() {
    let server = MockServer::start();
    let client = client_for(&server);

    {
        let mut tx = client.transaction(0, &[]).unwrap();
        tx.add::<ExpectOk>(Command::new(0, "SET").arg("k").arg("v"))
            .unwrap();
    }
    assert_eq!(server.count_commands("DISCARD"), 1);

    // The session went back to the pool outside MULTI
    assert_eq!(
        client
            .expect_bulk_string(Command::new(0, "GET").arg("k"))
            .unwrap(),
        None
    );
    assert_eq!(client.stats().created, 1);
}
