use super::future::ResponseFuture;
use super::{AsyncRequest, PendingRequest};
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::protocol::{Command, ExpectOk, Expectation, RespValue};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// MULTI/EXEC block on one dedicated connection.
///
/// Every added command must be acknowledged with `QUEUED` before the next
/// one goes out. Values only materialise after `exec`.
pub struct Transaction {
    conn: PooledConnection,
    db: u32,
    requests: Vec<Box<dyn PendingRequest>>,
    open: bool,
}

impl Transaction {
    /// Send `WATCH` for `watch` (if any) and `MULTI`
    pub fn begin(mut conn: PooledConnection, db: u32, watch: &[Bytes]) -> Result<Self> {
        if !watch.is_empty() {
            let cmd = Command::new(db, "WATCH").args(watch.iter().cloned());
            ExpectOk::project(conn.send_receive(&cmd)?, true)?;
        }
        ExpectOk::project(conn.send_receive(&Command::new(db, "MULTI"))?, true)?;
        Ok(Self {
            conn,
            db,
            requests: Vec::new(),
            open: true,
        })
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Queue one command. A server error reply (unknown command, wrong
    /// arity) is returned here and the server will abort the EXEC.
    pub fn add<E: Expectation>(&mut self, cmd: Command) -> Result<ResponseFuture<E::Output>> {
        cmd.validate()?;
        if cmd.db() != self.db {
            return Err(Error::MissingParameter(format!(
                "transaction runs on db {}, {} targets db {}",
                self.db,
                cmd,
                cmd.db()
            )));
        }
        let reply = self.conn.send_receive(&cmd)?;
        match reply {
            RespValue::SimpleString(ref s) if s.eq_ignore_ascii_case(b"QUEUED") => {}
            RespValue::Error(message) => return Err(Error::Server(message)),
            other => {
                self.conn.discard();
                return Err(Error::corrupt(format!(
                    "expected QUEUED for {}, got {}",
                    cmd,
                    other.kind()
                )));
            }
        }

        let (request, future) = AsyncRequest::<E>::new(cmd, Duration::from_secs(60));
        request.initiate();
        self.requests.push(Box::new(request));
        Ok(future)
    }

    /// Run the block. `Ok(false)` means a watched key changed and the server
    /// aborted it; every queued future is then canceled.
    pub fn exec(mut self) -> Result<bool> {
        self.open = false;
        let reply = match self.conn.send_receive(&Command::new(self.db, "EXEC")) {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_all(&e);
                return Err(e);
            }
        };

        match reply {
            RespValue::Array(Some(items)) if items.len() == self.requests.len() => {
                for (request, item) in self.requests.iter().zip(items) {
                    request.complete_with(item);
                }
                debug!("Transaction of {} commands committed", self.requests.len());
                Ok(true)
            }
            RespValue::Array(Some(items)) => {
                self.conn.discard();
                let e = Error::corrupt(format!(
                    "EXEC returned {} replies for {} commands",
                    items.len(),
                    self.requests.len()
                ));
                self.fail_all(&e);
                Err(e)
            }
            RespValue::Array(None) | RespValue::BulkString(None) => {
                debug!("Transaction aborted by WATCH");
                for request in &self.requests {
                    request.cancel();
                }
                Ok(false)
            }
            RespValue::Error(message) => {
                let e = Error::Server(message);
                self.fail_all(&e);
                Err(e)
            }
            other => {
                self.conn.discard();
                let e = Error::corrupt(format!("unexpected EXEC reply {}", other.kind()));
                self.fail_all(&e);
                Err(e)
            }
        }
    }

    /// Send DISCARD and cancel every queued future
    pub fn discard(mut self) -> Result<()> {
        self.open = false;
        for request in &self.requests {
            request.cancel();
        }
        let reply = self.conn.send_receive(&Command::new(self.db, "DISCARD"))?;
        ExpectOk::project(reply, true).map(|_| ())
    }

    fn fail_all(&self, error: &Error) {
        for request in &self.requests {
            request.fail(error.duplicate());
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        for request in &self.requests {
            request.cancel();
        }
        // Never return a session stuck inside MULTI to the pool
        let discarded = self
            .conn
            .send_receive(&Command::new(self.db, "DISCARD"))
            .map(|reply| matches!(reply, RespValue::SimpleString(_)));
        if !matches!(discarded, Ok(true)) {
            warn!("Abandoned transaction could not be discarded; closing its connection");
            self.conn.discard();
        }
    }
}
