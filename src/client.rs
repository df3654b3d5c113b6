//! Application-facing client
//!
//! [`Client`] owns one [`ConnectionPool`] and exposes one `expect_*` entry
//! point per result shape. Wrappers for specific commands sit on top of
//! these; the client itself knows no command semantics.

use crate::config::Config;
use crate::error::Result;
use crate::monitor::{MonitorChannel, MonitorMessage};
use crate::pool::{ConnectionPool, PoolStats};
use crate::protocol::expect::*;
use crate::protocol::{Command, Role};
use crate::pubsub::PubSubChannel;
use crate::request::batch::Pipeline;
use crate::request::future::ResponseFuture;
use crate::request::transaction::Transaction;
use crate::runtime::ClientRuntime;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    /// Client on the process-wide runtime
    pub fn new(config: Config) -> Result<Self> {
        Self::with_runtime(config, ClientRuntime::shared()?)
    }

    /// Client on an explicitly built runtime
    pub fn with_runtime(config: Config, runtime: Arc<ClientRuntime>) -> Result<Self> {
        let pool = ConnectionPool::new(&config, runtime)?;
        debug!("Client created for {}", pool.name());
        Ok(Self { pool })
    }

    /// Single endpoint, default settings, shared runtime
    ///
    /// # Example
    ///
    /// ```no_run
    /// use feox_client::{Client, Command};
    ///
    /// # fn main() -> feox_client::Result<()> {
    /// let client = Client::connect("127.0.0.1:6379")?;
    /// client.expect_ok(Command::new(0, "SET").arg("greeting").arg("hello"))?;
    /// let value = client.expect_bulk_string(Command::new(0, "GET").arg("greeting"))?;
    /// assert_eq!(value.as_deref(), Some("hello"));
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(endpoint: impl Into<String>) -> Result<Self> {
        Self::new(Config::with_endpoint(endpoint))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn execute<E: Expectation>(&self, cmd: Command) -> Result<E::Output> {
        self.pool.execute::<E>(cmd)
    }

    pub fn execute_async<E: Expectation>(&self, cmd: Command) -> Result<ResponseFuture<E::Output>> {
        self.pool.execute_async::<E>(cmd)
    }

    /// Execute with the result shape chosen at runtime
    pub fn execute_tagged(&self, tag: ExpectTag, cmd: Command) -> Result<TypedResult> {
        let reply = self.pool.execute_reply(&cmd)?;
        tag.project_reply(reply, cmd.throw_on_error())
    }

    pub fn expect_array(&self, cmd: Command) -> Result<Option<Vec<RedisValue>>> {
        self.execute::<ExpectArray>(cmd)
    }

    pub fn expect_bulk_string(&self, cmd: Command) -> Result<Option<String>> {
        self.execute::<ExpectBulkString>(cmd)
    }

    pub fn expect_bulk_string_bytes(&self, cmd: Command) -> Result<Option<Bytes>> {
        self.execute::<ExpectBulkStringBytes>(cmd)
    }

    pub fn expect_double(&self, cmd: Command) -> Result<f64> {
        self.execute::<ExpectDouble>(cmd)
    }

    pub fn expect_greater_than_zero(&self, cmd: Command) -> Result<bool> {
        self.execute::<ExpectGreaterThanZero>(cmd)
    }

    pub fn expect_integer(&self, cmd: Command) -> Result<i64> {
        self.execute::<ExpectInteger>(cmd)
    }

    pub fn expect_multi_data_bytes(&self, cmd: Command) -> Result<Vec<Option<Bytes>>> {
        self.execute::<ExpectMultiDataBytes>(cmd)
    }

    pub fn expect_multi_data_strings(&self, cmd: Command) -> Result<Vec<Option<String>>> {
        self.execute::<ExpectMultiDataStrings>(cmd)
    }

    pub fn expect_nothing(&self, cmd: Command) -> Result<()> {
        self.execute::<ExpectNothing>(cmd)
    }

    pub fn expect_nullable_double(&self, cmd: Command) -> Result<Option<f64>> {
        self.execute::<ExpectNullableDouble>(cmd)
    }

    pub fn expect_nullable_integer(&self, cmd: Command) -> Result<Option<i64>> {
        self.execute::<ExpectNullableInteger>(cmd)
    }

    pub fn expect_ok(&self, cmd: Command) -> Result<bool> {
        self.execute::<ExpectOk>(cmd)
    }

    pub fn expect_one(&self, cmd: Command) -> Result<bool> {
        self.execute::<ExpectOne>(cmd)
    }

    pub fn expect_simple_string(&self, cmd: Command) -> Result<String> {
        self.execute::<ExpectSimpleString>(cmd)
    }

    pub fn expect_simple_string_bytes(&self, cmd: Command) -> Result<Bytes> {
        self.execute::<ExpectSimpleStringBytes>(cmd)
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Flush `pipeline` on one connection picked by its first command's db
    pub fn run_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire(pipeline.db(), Role::Any)?;
        pipeline.execute(&mut conn)
    }

    /// Start MULTI on a master connection, watching `watch` first
    pub fn transaction(&self, db: u32, watch: &[Bytes]) -> Result<Transaction> {
        let conn = self.pool.acquire(db, Role::Master)?;
        Transaction::begin(conn, db, watch)
    }

    pub fn pubsub(&self) -> Result<Arc<PubSubChannel>> {
        PubSubChannel::open(&self.pool)
    }

    pub fn monitor<F>(&self, callback: F) -> Result<Arc<MonitorChannel>>
    where
        F: Fn(&MonitorMessage) + Send + Sync + 'static,
    {
        MonitorChannel::open(&self.pool, callback)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_disposed()
    }

    /// Dispose the pool together with every channel opened from it
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::runtime::RuntimeOptions;

    #[test]
    fn invalid_config_is_rejected_before_connecting() {
        let runtime = ClientRuntime::new(RuntimeOptions::default()).unwrap();
        let config = Config {
            endpoints: Vec::new(),
            ..Default::default()
        };
        let err = Client::with_runtime(config, runtime).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Config);
    }
}
