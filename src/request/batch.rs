use super::future::ResponseFuture;
use super::{AsyncRequest, PendingRequest};
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::protocol::{Command, Expectation};
use std::time::Duration;
use tracing::debug;

/// Commands written to one connection in a single flush.
///
/// Replies are read back in order after the flush; each command's future
/// settles once its reply is in.
pub struct Pipeline {
    requests: Vec<Box<dyn PendingRequest>>,
    timeout: Duration,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Queue `cmd`. Every command must target the database of the first,
    /// since the whole batch runs on one connection.
    pub fn add<E: Expectation>(&mut self, cmd: Command) -> Result<ResponseFuture<E::Output>> {
        cmd.validate()?;
        if !self.requests.is_empty() && cmd.db() != self.db() {
            return Err(Error::MissingParameter(format!(
                "pipeline runs on db {}, {} targets db {}",
                self.db(),
                cmd,
                cmd.db()
            )));
        }
        let (request, future) = AsyncRequest::<E>::new(cmd, self.timeout);
        self.requests.push(Box::new(request));
        Ok(future)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Database of the first command, which picks the connection
    pub fn db(&self) -> u32 {
        self.requests.first().map_or(0, |r| r.command().db())
    }

    /// Flush every command and settle the futures. A transport failure
    /// fails every request that did not get its reply.
    pub fn execute(self, conn: &mut PooledConnection) -> Result<()> {
        if self.requests.is_empty() {
            return Ok(());
        }
        let commands: Vec<Command> = self.requests.iter().map(|r| r.command().clone()).collect();
        for request in &self.requests {
            request.initiate();
        }

        match conn.pipeline(&commands) {
            Ok(replies) => {
                debug!("Pipeline of {} commands completed", replies.len());
                for (request, reply) in self.requests.iter().zip(replies) {
                    request.complete_with(reply);
                }
                Ok(())
            }
            Err(e) => {
                for request in &self.requests {
                    request.fail(e.duplicate());
                }
                Err(e)
            }
        }
    }

    /// Drop the batch without sending anything; every future is canceled
    pub fn cancel(self) {}
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for request in &self.requests {
            request.cancel();
        }
    }
}
