//! Requests and their results
//!
//! Every flavour (direct, async, pipelined, transactional) runs through the
//! same state machine. The expectation type parameter picks the reply
//! projection and gives each request a typed completion slot.

pub mod batch;
pub mod future;
pub mod queue;
pub mod state;
pub mod transaction;

use crate::error::{Error, Result};
use crate::protocol::{Command, Expectation, RespValue};
use future::{Completion, ResponseFuture};
use state::RequestState;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Type-erased view of a request waiting for its reply
pub trait PendingRequest: Send {
    fn command(&self) -> &Command;

    fn state(&self) -> RequestState;

    fn created_at(&self) -> Instant;

    fn timeout(&self) -> Duration;

    fn initiate(&self) -> bool;

    /// Project `reply` and settle the request with the outcome
    fn complete_with(&self, reply: RespValue) -> bool;

    /// Settle a command that was sent without reading its reply
    fn complete_unread(&self) -> bool;

    fn fail(&self, error: Error) -> bool;

    fn cancel(&self) -> bool;

    fn remaining(&self, now: Instant) -> Duration {
        self.timeout()
            .saturating_sub(now.saturating_duration_since(self.created_at()))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
}

/// A request bound to the expectation `E`
pub struct AsyncRequest<E: Expectation> {
    command: Command,
    completion: Completion<E::Output>,
    timeout: Duration,
    _expect: PhantomData<fn() -> E>,
}

impl<E: Expectation> AsyncRequest<E> {
    pub fn new(command: Command, timeout: Duration) -> (Self, ResponseFuture<E::Output>) {
        let (completion, future) = Completion::new();
        (
            Self {
                command,
                completion,
                timeout,
                _expect: PhantomData,
            },
            future,
        )
    }

    /// Settle from the outcome of a round trip. `Ok(None)` means the
    /// command was sent fire-and-forget.
    pub fn settle(&self, reply: Result<Option<RespValue>>) -> bool {
        match reply {
            Ok(Some(reply)) => self.complete_with(reply),
            Ok(None) => self.complete_unread(),
            Err(e) => self.fail(e),
        }
    }
}

impl<E: Expectation> PendingRequest for AsyncRequest<E> {
    fn command(&self) -> &Command {
        &self.command
    }

    fn state(&self) -> RequestState {
        self.completion.state()
    }

    fn created_at(&self) -> Instant {
        self.completion.created_at()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn initiate(&self) -> bool {
        self.completion.initiate()
    }

    fn complete_with(&self, reply: RespValue) -> bool {
        match E::project(reply, self.command.throw_on_error()) {
            Ok(value) => self.completion.complete(value),
            Err(e) => self.completion.fail(e),
        }
    }

    fn complete_unread(&self) -> bool {
        match E::project_reply(None, self.command.throw_on_error()) {
            Ok(value) => self.completion.complete(value),
            Err(e) => self.completion.fail(e),
        }
    }

    fn fail(&self, error: Error) -> bool {
        self.completion.fail(error)
    }

    fn cancel(&self) -> bool {
        self.completion.cancel()
    }
}
