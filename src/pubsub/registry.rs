use super::message::Message;
use crate::runtime::mailbox::{Handler, Mailbox};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

pub type MessageCallback = Handler<Message>;

/// One callback on one channel or pattern, with its own mailbox so messages
/// reach it in wire order without waiting on other subscribers
pub type Subscription = Mailbox<Message>;

/// Subscriptions of one axis (channels or patterns), split into those sent
/// but not yet acknowledged and those the server confirmed
#[derive(Default)]
pub struct SubscriptionRegistry {
    pending: DashMap<Bytes, Vec<Arc<Subscription>>>,
    confirmed: DashMap<Bytes, Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, name: &[u8], callback: &MessageCallback) -> bool {
        let has = |map: &DashMap<Bytes, Vec<Arc<Subscription>>>| {
            map.get(name)
                .is_some_and(|subs| subs.iter().any(|s| s.handles(callback)))
        };
        has(&self.pending) || has(&self.confirmed)
    }

    /// Register `callback` under pending. False if it already listens on `name`.
    pub fn add_pending(&self, name: Bytes, callback: &MessageCallback) -> bool {
        if self.is_subscribed(&name, callback) {
            return false;
        }
        self.pending
            .entry(name)
            .or_default()
            .push(Subscription::new(Arc::clone(callback)));
        true
    }

    /// Move every pending subscription of `name` to confirmed
    pub fn confirm(&self, name: &[u8]) -> usize {
        match self.pending.remove(name) {
            Some((name, subs)) => {
                let moved = subs.len();
                self.confirmed.entry(name).or_default().extend(subs);
                moved
            }
            None => 0,
        }
    }

    /// Confirmed subscriptions for `name`
    pub fn subscribers(&self, name: &[u8]) -> Vec<Arc<Subscription>> {
        self.confirmed
            .get(name)
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    /// Drop one callback's pending registration, used when the send failed
    pub fn remove_pending(&self, name: &[u8], callback: &MessageCallback) {
        if let Some(mut subs) = self.pending.get_mut(name) {
            subs.retain(|s| !s.handles(callback));
            if subs.is_empty() {
                drop(subs);
                self.pending.remove(name);
            }
        }
    }

    /// Forget `name` entirely
    pub fn remove(&self, name: &[u8]) {
        self.pending.remove(name);
        self.confirmed.remove(name);
    }

    /// Forget everything, both pending and confirmed
    pub fn clear(&self) {
        self.pending.clear();
        self.confirmed.clear();
    }

    /// Move confirmed subscriptions back to pending ahead of a resubscribe.
    /// Returns every pending name afterwards.
    pub fn requeue_confirmed(&self) -> Vec<Bytes> {
        let names: Vec<Bytes> = self.confirmed.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((name, subs)) = self.confirmed.remove(&name) {
                self.pending.entry(name).or_default().extend(subs);
            }
        }
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
