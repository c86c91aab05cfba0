//! Reference-counted service subscriptions
//!
//! A lookup pins its service for the client's lifetime; explicit
//! `subscribe` calls are counted separately so releasing them never drops a
//! service that lookups still depend on.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::ServiceKey;

#[derive(Debug, Default, Clone, Copy)]
struct Subscription {
    /// Pinned by a lookup
    implicit: bool,
    /// Unreleased explicit subscriptions
    refs: usize,
}

/// Services the refresh loop keeps up to date
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<ServiceKey, Subscription>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `key` on behalf of a lookup.
    ///
    /// Returns `true` when the service was not tracked before.
    pub fn ensure(&self, key: &ServiceKey) -> bool {
        if self.subscriptions.get(key).is_some_and(|s| s.implicit) {
            return false;
        }
        match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().implicit = true;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Subscription {
                    implicit: true,
                    refs: 0,
                });
                true
            }
        }
    }

    /// Take an explicit reference on `key`; returns the explicit count
    pub fn subscribe(&self, key: &ServiceKey) -> usize {
        let mut subscription = self.subscriptions.entry(key.clone()).or_default();
        subscription.refs += 1;
        subscription.refs
    }

    /// Release an explicit reference on `key`.
    ///
    /// When this drops the last reference of a service no lookup pinned,
    /// `on_removed` runs before the entry goes away and while it is still
    /// locked, and `true` is returned.
    pub fn unsubscribe(&self, key: &ServiceKey, on_removed: impl FnOnce()) -> bool {
        let Entry::Occupied(mut entry) = self.subscriptions.entry(key.clone()) else {
            return false;
        };
        let subscription = entry.get_mut();
        if subscription.refs == 0 {
            return false;
        }
        subscription.refs -= 1;
        if subscription.refs > 0 || subscription.implicit {
            return false;
        }
        on_removed();
        entry.remove();
        true
    }

    /// Run `f` only if `key` is tracked, holding the entry so a concurrent
    /// [`Self::unsubscribe`] waits for `f` to finish.
    pub fn while_subscribed<R>(&self, key: &ServiceKey, f: impl FnOnce() -> R) -> Option<R> {
        let _held = self.subscriptions.get(key)?;
        Some(f())
    }

    #[must_use]
    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    /// Snapshot of subscribed keys
    #[must_use]
    pub fn keys(&self) -> Vec<ServiceKey> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&self) {
        self.subscriptions.clear();
    }
}
