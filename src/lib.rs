//! FeOx-client: pooled Redis client with heartbeat monitoring and pub/sub
//!
//! This crate speaks RESP to Redis-compatible servers through a bounded,
//! role-aware connection pool, and hands typed results back to callers.
//!
//! # Architecture
//!
//! - Blocking, thread-based I/O; one socket per in-flight request
//! - Process-owned services (worker pool, idle purger, heartbeat) behind
//!   an injectable [`ClientRuntime`]
//! - Result shapes picked at compile time through [`Expectation`] types
//! - Async overflow queue, pipelines and MULTI/EXEC transactions
//! - Dedicated pub/sub and MONITOR channels with ordered callback dispatch

/// Application-facing facade
pub mod client;

/// Configuration management for the client
pub mod config;

/// Error types and result aliases
pub mod error;

/// Liveness probing of pools and channels
pub mod heartbeat;

/// MONITOR stream channel
pub mod monitor;

/// Transport sessions
pub mod network;

/// Connection pooling
pub mod pool;

/// Redis protocol (RESP) implementation and typed projections
pub mod protocol;

/// Pub/Sub channel and subscription bookkeeping
pub mod pubsub;

/// Request lifecycle: futures, async queue, pipelines, transactions
pub mod request;

/// Shared worker threads and timers
pub mod runtime;

pub use client::Client;
pub use config::Config;
pub use error::{ConnectionErrorKind, Error, ErrorCode, Result};
pub use heartbeat::{Cardio, Probe, PulseEvent};
pub use monitor::{MonitorChannel, MonitorMessage};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use protocol::{
    Command, ExpectArray, ExpectBulkString, ExpectBulkStringBytes, ExpectDouble,
    ExpectGreaterThanZero, ExpectInteger, ExpectMultiDataBytes, ExpectMultiDataStrings,
    ExpectNothing, ExpectNullableDouble, ExpectNullableInteger, ExpectOk, ExpectOne,
    ExpectSimpleString, ExpectSimpleStringBytes, ExpectTag, Expectation, RedisValue, Role,
    SendType, TypedResult,
};
pub use pubsub::{Message, PubSubChannel};
pub use request::batch::Pipeline;
pub use request::future::ResponseFuture;
pub use request::state::RequestState;
pub use request::transaction::Transaction;
pub use runtime::{ClientRuntime, RuntimeOptions};
