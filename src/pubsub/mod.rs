mod channel;
mod message;
mod registry;

pub use channel::PubSubChannel;
pub use message::{Message, PubSubMessage};
pub use registry::{MessageCallback, Subscription, SubscriptionRegistry};

/// Snapshot of a channel's subscriptions and traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PubSubStats {
    pub channels: usize,
    pub patterns: usize,
    pub pending_channels: usize,
    pub pending_patterns: usize,
    /// Messages handed to at least one callback
    pub delivered: u64,
    /// Messages for channels nobody confirmed
    pub dropped: u64,
}
