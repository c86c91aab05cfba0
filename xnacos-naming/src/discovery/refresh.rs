//! Background refresh of subscribed services
//!
//! One loop drives periodic ticks and reacts to stale-read signals from the
//! cache. Every fetch runs as its own tracked task; at most one fetch per
//! service is in flight, later requests attach to the running one.
//!
//! A failed fetch never touches the cache: callers keep the last-known
//! instance set until a refresh succeeds. A fetch that lands after its
//! service was unsubscribed is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::subscription::SubscriptionRegistry;
use crate::cache::InstanceCache;
use crate::model::{Instance, ServiceKey};
use crate::session::ConnectionManager;
use crate::transport::NamingTransport;
use xnacos_core::resilience::{retry, RetryPolicy};
use xnacos_core::{Error, Result};

/// Progress of one fetch
#[derive(Debug, Clone)]
pub enum FetchState {
    Pending,
    Done(Result<()>),
}

/// Awaitable outcome of a scheduled refresh
pub struct RefreshHandle {
    rx: watch::Receiver<FetchState>,
}

impl RefreshHandle {
    fn closed() -> Self {
        let (_, rx) = watch::channel(FetchState::Done(Err(Error::Closed)));
        Self { rx }
    }

    /// Wait until the fetch finished and the cache was updated
    pub async fn wait(mut self) -> Result<()> {
        let outcome = match self
            .rx
            .wait_for(|state| !matches!(state, FetchState::Pending))
            .await
        {
            Ok(state) => match &*state {
                FetchState::Done(result) => result.clone(),
                FetchState::Pending => Err(Error::Closed),
            },
            // Fetch task dropped without reporting
            Err(_) => Err(Error::Closed),
        };
        outcome
    }
}

/// Everything a fetch task needs, cloned into the task
#[derive(Clone)]
struct FetchContext {
    cache: Arc<InstanceCache>,
    subscriptions: Arc<SubscriptionRegistry>,
    connection: Arc<ConnectionManager>,
    transport: Arc<dyn NamingTransport>,
    in_flight: Arc<DashMap<ServiceKey, Arc<watch::Sender<FetchState>>>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

/// Refresh coordinator
pub struct RefreshCoordinator {
    ctx: FetchContext,
    interval: Duration,
    tracker: TaskTracker,
    fetches_started: AtomicU64,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        cache: Arc<InstanceCache>,
        connection: Arc<ConnectionManager>,
        transport: Arc<dyn NamingTransport>,
        subscriptions: Arc<SubscriptionRegistry>,
        retry: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            ctx: FetchContext {
                cache,
                subscriptions,
                connection,
                transport,
                in_flight: Arc::new(DashMap::new()),
                retry,
                cancel: CancellationToken::new(),
            },
            interval,
            tracker: TaskTracker::new(),
            fetches_started: AtomicU64::new(0),
        }
    }

    /// Start a fetch of `key` unless one is already pending.
    ///
    /// The returned handle resolves when the (possibly shared) fetch ends.
    pub fn schedule_refresh(&self, key: &ServiceKey) -> RefreshHandle {
        if self.ctx.cancel.is_cancelled() {
            return RefreshHandle::closed();
        }

        let tx = match self.ctx.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                trace!(service = %key, "Refresh already in flight");
                return RefreshHandle {
                    rx: entry.get().subscribe(),
                };
            }
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(FetchState::Pending);
                let tx = Arc::new(tx);
                entry.insert(Arc::clone(&tx));
                tx
            }
        };

        let rx = tx.subscribe();
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        self.tracker
            .spawn(Self::run_fetch(self.ctx.clone(), key.clone(), tx));

        RefreshHandle { rx }
    }

    /// Schedule a fetch for every subscribed service whose view is stale or
    /// absent. Returns how many services needed one.
    pub fn tick(&self) -> usize {
        let mut due = 0;
        for key in self.ctx.subscriptions.keys() {
            if self.needs_refresh(&key) {
                self.schedule_refresh(&key);
                due += 1;
            }
        }
        if due > 0 {
            debug!(due, subscriptions = self.ctx.subscriptions.len(), "Refresh tick");
        }
        due
    }

    /// Spawn the refresh loop.
    ///
    /// `signals` carries stale-read notifications from the cache.
    pub fn start(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<ServiceKey>) {
        let this = Arc::clone(self);
        let cancel = self.ctx.cancel.clone();
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, "Starting refresh loop");

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Refresh loop shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        this.tick();
                    }
                    Some(key) = signals.recv() => {
                        if this.ctx.subscriptions.contains(&key) && this.needs_refresh(&key) {
                            this.schedule_refresh(&key);
                        }
                    }
                }
            }
        });
    }

    /// Cancel the loop and every pending fetch without waiting
    pub fn shutdown(&self) {
        self.ctx.cancel.cancel();
        self.tracker.close();
    }

    /// Cancel everything and wait for the tasks to finish
    pub async fn close(&self) {
        self.shutdown();
        self.tracker.wait().await;
        self.ctx.in_flight.clear();
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &ServiceKey) -> bool {
        self.ctx.in_flight.contains_key(key)
    }

    /// Fetch tasks started so far
    #[must_use]
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::Relaxed)
    }

    fn needs_refresh(&self, key: &ServiceKey) -> bool {
        self.ctx.cache.peek(key).is_none_or(|view| view.is_stale())
    }

    async fn run_fetch(ctx: FetchContext, key: ServiceKey, tx: Arc<watch::Sender<FetchState>>) {
        let outcome = tokio::select! {
            () = ctx.cancel.cancelled() => Err(Error::Closed),
            result = Self::fetch(&ctx, &key) => result,
        };

        let result = match outcome {
            Ok(instances) => {
                let count = instances.len();
                // Holding the subscription keeps a concurrent unsubscribe from
                // evicting between the check and the write
                let stored = ctx
                    .subscriptions
                    .while_subscribed(&key, || ctx.cache.put(&key, instances));
                match stored {
                    Some(view) => debug!(
                        service = %key,
                        instances = count,
                        revision = view.revision,
                        "Service refreshed"
                    ),
                    None => debug!(service = %key, "Service unsubscribed during refresh, result dropped"),
                }
                Ok(())
            }
            Err(Error::Closed) => Err(Error::Closed),
            Err(e) => {
                warn!(
                    service = %key,
                    error = %e,
                    cached = ctx.cache.peek(&key).is_some(),
                    "Refresh failed, keeping last-known instances"
                );
                Err(e)
            }
        };

        ctx.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &tx));
        tx.send_replace(FetchState::Done(result));
    }

    async fn fetch(ctx: &FetchContext, key: &ServiceKey) -> Result<Vec<Instance>> {
        ctx.connection
            .with_session(|session| {
                let transport = Arc::clone(&ctx.transport);
                let key = key.clone();
                let policy = ctx.retry;
                async move {
                    retry(&policy, "fetch_instances", || {
                        transport.fetch_instances(&session, &key)
                    })
                    .await
                }
            })
            .await
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}
