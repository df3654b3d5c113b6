use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a request. Transitions only move forward:
/// `Waiting -> Initiated -> {Completed, Canceled, Failed}`, and a waiting
/// request may also be canceled or failed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Waiting = 0,
    Initiated = 1,
    Completed = 2,
    Canceled = 3,
    Failed = 4,
}

impl RequestState {
    fn from_u8(value: u8) -> RequestState {
        match value {
            0 => RequestState::Waiting,
            1 => RequestState::Initiated,
            2 => RequestState::Completed,
            3 => RequestState::Canceled,
            _ => RequestState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Canceled | RequestState::Failed
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Waiting => "waiting",
            RequestState::Initiated => "initiated",
            RequestState::Completed => "completed",
            RequestState::Canceled => "canceled",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct AtomicRequestState(AtomicU8);

impl AtomicRequestState {
    pub fn new() -> Self {
        Self(AtomicU8::new(RequestState::Waiting as u8))
    }

    pub fn load(&self) -> RequestState {
        RequestState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Waiting -> Initiated`. False if someone else moved it first.
    pub fn initiate(&self) -> bool {
        self.0
            .compare_exchange(
                RequestState::Waiting as u8,
                RequestState::Initiated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to a terminal state. Exactly one caller ever gets `true`.
    pub fn finish(&self, target: RequestState) -> bool {
        debug_assert!(target.is_terminal());
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!RequestState::from_u8(current).is_terminal()).then_some(target as u8)
            })
            .is_ok()
    }
}

impl Default for AtomicRequestState {
    fn default() -> Self {
        Self::new()
    }
}
