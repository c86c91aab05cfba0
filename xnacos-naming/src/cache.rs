//! Last-known instance sets per service
//!
//! Reads never block on the registry: a stale or missing view is reported to
//! the refresh loop through an unbounded channel and the caller gets whatever
//! is cached right now.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use crate::model::{Instance, ServiceKey, ServiceView};

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Emitted when a service's instance set changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: ServiceKey,
    pub revision: u64,
    pub instance_count: usize,
}

/// Instance cache keyed by service
pub struct InstanceCache {
    views: DashMap<ServiceKey, Arc<ServiceView>>,
    ttl: Duration,
    revisions: AtomicU64,
    changes: broadcast::Sender<CacheEvent>,
    refresh_signal: mpsc::UnboundedSender<ServiceKey>,
}

impl InstanceCache {
    /// Create a cache and the receiving end of its refresh signal
    #[must_use]
    pub fn new(ttl: Duration) -> (Self, mpsc::UnboundedReceiver<ServiceKey>) {
        let (refresh_signal, signals) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let cache = Self {
            views: DashMap::new(),
            ttl,
            revisions: AtomicU64::new(0),
            changes,
            refresh_signal,
        };
        (cache, signals)
    }

    /// Current view of `key`, possibly stale.
    ///
    /// Signals the refresh loop when the view is stale or absent.
    pub fn get(&self, key: &ServiceKey) -> Option<Arc<ServiceView>> {
        let view = self.peek(key);
        if view.as_ref().is_none_or(|v| v.is_stale()) {
            // Receiver gone means the client is shutting down
            let _ = self.refresh_signal.send(key.clone());
        }
        view
    }

    /// Current view of `key` without signalling a refresh
    pub fn peek(&self, key: &ServiceKey) -> Option<Arc<ServiceView>> {
        self.views.get(key).map(|v| Arc::clone(v.value()))
    }

    /// Replace the view of `key` with a freshly fetched instance set
    pub fn put(&self, key: &ServiceKey, instances: Vec<Instance>) -> Arc<ServiceView> {
        let instance_count = instances.len();
        let (view, changed) = match self.views.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                let changed = !same_instances(&previous.instances, &instances);
                let revision = if changed {
                    self.next_revision()
                } else {
                    previous.revision
                };
                let view = Arc::new(self.view(key, instances, revision));
                entry.insert(Arc::clone(&view));
                (view, changed)
            }
            Entry::Vacant(entry) => {
                let view = Arc::new(self.view(key, instances, self.next_revision()));
                entry.insert(Arc::clone(&view));
                (view, true)
            }
        };

        if changed {
            debug!(
                service = %key,
                revision = view.revision,
                instances = instance_count,
                "Instance set changed"
            );
            // No subscribers is fine
            let _ = self.changes.send(CacheEvent {
                key: key.clone(),
                revision: view.revision,
                instance_count,
            });
        }

        view
    }

    /// Drop the view of `key`
    pub fn remove(&self, key: &ServiceKey) -> Option<Arc<ServiceView>> {
        self.views.remove(key).map(|(_, view)| view)
    }

    pub fn clear(&self) {
        self.views.clear();
    }

    /// Receive change notifications
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheEvent> {
        self.changes.subscribe()
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn view(&self, key: &ServiceKey, instances: Vec<Instance>, revision: u64) -> ServiceView {
        ServiceView {
            key: key.clone(),
            instances,
            fetched_at: Instant::now(),
            ttl: self.ttl,
            revision,
        }
    }
}

fn same_instances(a: &[Instance], b: &[Instance]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}
