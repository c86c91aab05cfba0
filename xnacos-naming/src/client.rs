//! Naming client
//!
//! Entry point for callers. Owns the session, the instance cache, the
//! selector and the refresh loop; nothing is global, share the client with
//! `Arc<NamingClient>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cache::{CacheEvent, InstanceCache};
use crate::discovery::{HealthSelector, RefreshCoordinator, SubscriptionRegistry};
use crate::model::{Credentials, Instance, ServiceKey, ServiceView};
use crate::session::{ConnectionManager, SessionConfig};
use crate::transport::{HttpTransport, NamingTransport};
use xnacos_core::{Config, Error, Result, RetryPolicy};

/// Which service to resolve and how to narrow it down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectParams {
    pub service_name: String,
    /// Falls back to the configured group
    pub group: Option<String>,
    /// Empty means every cluster
    pub clusters: Vec<String>,
}

impl SelectParams {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn clusters<I, S>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clusters = clusters.into_iter().map(Into::into).collect();
        self
    }
}

/// Service discovery client
pub struct NamingClient {
    config: Config,
    connection: Arc<ConnectionManager>,
    cache: Arc<InstanceCache>,
    selector: HealthSelector,
    subscriptions: Arc<SubscriptionRegistry>,
    refresh: Arc<RefreshCoordinator>,
    /// Taken by the refresh loop on first use
    refresh_signals: Mutex<Option<mpsc::UnboundedReceiver<ServiceKey>>>,
    closed: AtomicBool,
}

impl NamingClient {
    /// Build a client on top of `transport`.
    ///
    /// Validates `config` but does not contact the registry; the session and
    /// the refresh loop start with the first lookup.
    pub fn new(config: Config, transport: Arc<dyn NamingTransport>) -> Result<Self> {
        config.validate()?;

        let registry = &config.registry;
        let credentials = registry
            .has_credentials()
            .then(|| Credentials::new(&registry.username, &registry.password));
        let retry = RetryPolicy::from(&config.retry);

        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&transport),
            SessionConfig {
                endpoint: registry.endpoint(),
                namespace_id: registry.namespace_id.clone().unwrap_or_default(),
                credentials,
                grace: config.cache.token_grace(),
                retry,
            },
        ));

        let (cache, signals) = InstanceCache::new(config.cache.ttl());
        let cache = Arc::new(cache);
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&connection),
            transport,
            Arc::clone(&subscriptions),
            retry,
            config.cache.refresh_interval(),
        ));

        info!(
            endpoint = %registry.endpoint(),
            namespace = %registry.namespace_id.as_deref().unwrap_or_default(),
            group = %registry.group,
            anonymous = !registry.has_credentials(),
            "Naming client created"
        );

        Ok(Self {
            selector: HealthSelector::new(config.selection.fallback_to_unhealthy),
            config,
            connection,
            cache,
            subscriptions,
            refresh,
            refresh_signals: Mutex::new(Some(signals)),
            closed: AtomicBool::new(false),
        })
    }

    /// Client talking to the registry over HTTP
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config.registry)?;
        Self::new(config, Arc::new(transport))
    }

    /// Replace the random source used for selection
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.selector = HealthSelector::with_rng(self.config.selection.fallback_to_unhealthy, rng);
        self
    }

    /// Pick one healthy instance of `service_name` in the configured group
    pub async fn select_one_healthy_instance(&self, service_name: &str) -> Result<Instance> {
        self.select_one_healthy_instance_with(&SelectParams::new(service_name))
            .await
    }

    /// Pick one healthy instance with an explicit group and cluster filter
    pub async fn select_one_healthy_instance_with(&self, params: &SelectParams) -> Result<Instance> {
        let key = self.service_key(&params.service_name, params.group.as_deref())?;
        self.pin(&key);
        let view = self.resolve_view(&key).await?;
        let instance = self.selector.select_one(&view, &params.clusters)?;
        debug!(service = %key, instance = %instance.address(), "Selected instance");
        Ok(instance)
    }

    /// Every cached instance of `service_name`, healthy or not
    pub async fn get_all_instances(&self, service_name: &str) -> Result<Vec<Instance>> {
        let key = self.service_key(service_name, None)?;
        self.pin(&key);
        let view = self.resolve_view(&key).await?;
        Ok(view.instances.clone())
    }

    /// Keep `service_name` refreshed until the matching [`Self::unsubscribe`].
    ///
    /// Waits for the first fetch like a lookup would. Services that were
    /// looked up stay tracked regardless of explicit subscriptions.
    pub async fn subscribe(&self, service_name: &str) -> Result<()> {
        let key = self.service_key(service_name, None)?;
        let refs = self.subscriptions.subscribe(&key);
        debug!(service = %key, refs, "Subscribed");
        self.resolve_view(&key).await.map(|_| ())
    }

    /// Release a subscription; the last release drops the cached view unless
    /// a lookup pinned the service
    pub fn unsubscribe(&self, service_name: &str) -> Result<()> {
        let key = self.service_key(service_name, None)?;
        let removed = self.subscriptions.unsubscribe(&key, || {
            self.cache.remove(&key);
        });
        if removed {
            self.selector.forget(&key);
            debug!(service = %key, "Unsubscribed, cached view dropped");
        }
        Ok(())
    }

    /// Receive a notification whenever a service's instance set changes
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheEvent> {
        self.cache.subscribe_changes()
    }

    /// Selections served from unhealthy instances so far
    #[must_use]
    pub fn degraded_selections(&self) -> u64 {
        self.selector.degraded_selections()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the refresh loop, cancel pending fetches and release the session.
    ///
    /// Every later call fails with `Error::Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.refresh_signals.lock().take();
        self.refresh.close().await;
        self.connection.close();
        self.cache.clear();
        self.subscriptions.clear();
        self.selector.clear();
        info!("Naming client closed");
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn service_key(&self, service_name: &str, group: Option<&str>) -> Result<ServiceKey> {
        self.check_open()?;
        if service_name.trim().is_empty() {
            return Err(Error::Config("service name must not be empty".to_string()));
        }
        let group = group
            .filter(|g| !g.is_empty())
            .unwrap_or(&self.config.registry.group);
        Ok(ServiceKey::new(group, service_name))
    }

    fn ensure_started(&self) {
        if let Some(signals) = self.refresh_signals.lock().take() {
            self.refresh.start(signals);
        }
    }

    /// Track `key` for the client's lifetime
    fn pin(&self, key: &ServiceKey) {
        if self.subscriptions.ensure(key) {
            debug!(service = %key, "Tracking service");
        }
    }

    /// Cached view of `key`, waiting for the first fetch when there is none.
    ///
    /// `key` must already be subscribed or pinned.
    async fn resolve_view(&self, key: &ServiceKey) -> Result<Arc<ServiceView>> {
        self.ensure_started();

        let view = match self.cache.get(key) {
            Some(view) => view,
            None => {
                let wait_for = self.config.cache.first_fetch_timeout();
                let handle = self.refresh.schedule_refresh(key);
                match timeout(wait_for, handle.wait()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Error::Timeout(format!(
                            "first fetch of {key} took longer than {wait_for:?}"
                        )))
                    }
                }
                self.check_open()?;
                self.cache
                    .peek(key)
                    .ok_or_else(|| Error::NoInstance(key.to_string()))?
            }
        };

        let ceiling = self.config.cache.max_staleness();
        if view.age() > ceiling {
            return Err(Error::NoInstance(format!(
                "{key}: last successful refresh {:?} ago exceeds {ceiling:?}",
                view.age()
            )));
        }
        Ok(view)
    }
}

impl Drop for NamingClient {
    fn drop(&mut self) {
        self.refresh.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::test_helpers::{instance, test_config, FakeTransport};

    fn client(transport: &Arc<FakeTransport>) -> NamingClient {
        NamingClient::new(test_config(), transport.clone())
            .unwrap()
            .with_rng(StdRng::seed_from_u64(42))
    }

    #[test]
    fn test_select_params_builder() {
        let params = SelectParams::new("svc-a")
            .group("payments")
            .clusters(["hz", "sh"]);
        assert_eq!(params.service_name, "svc-a");
        assert_eq!(params.group.as_deref(), Some("payments"));
        assert_eq!(params.clusters, vec!["hz".to_string(), "sh".to_string()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.registry.port = 0;
        let err = NamingClient::new(config, Arc::new(FakeTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        let mut config = test_config();
        config.registry.namespace_id = None;
        assert!(matches!(
            NamingClient::new(config, Arc::new(FakeTransport::new())),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_service_name_rejected() {
        let transport = Arc::new(FakeTransport::new());
        let client = client(&transport);
        assert!(matches!(
            client.select_one_healthy_instance("  ").await,
            Err(Error::Config(_))
        ));
        assert_eq!(transport.fetch_calls(""), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_lookup_fetches_then_serves_from_cache() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);

        for _ in 0..10 {
            let selected = client.select_one_healthy_instance("svc-a").await.unwrap();
            assert_eq!(selected.ip, "10.0.0.1");
        }
        assert_eq!(transport.fetch_calls("svc-a"), 1);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_and_cluster_filter() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances(
            "svc-a",
            vec![
                instance("svc-a", "10.0.0.1", 9000).with_cluster("hz"),
                instance("svc-a", "10.0.0.2", 9000).with_cluster("sh"),
            ],
        );
        let client = client(&transport);

        let params = SelectParams::new("svc-a").group("payments").clusters(["sh"]);
        for _ in 0..10 {
            let selected = client.select_one_healthy_instance_with(&params).await.unwrap();
            assert_eq!(selected.ip, "10.0.0.2");
        }

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_first_fetch_times_out() {
        let transport = Arc::new(FakeTransport::new().with_fetch_delay(Duration::from_secs(10)));
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);

        let err = client.select_one_healthy_instance("svc-a").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_all_instances_includes_unhealthy() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances(
            "svc-a",
            vec![
                instance("svc-a", "10.0.0.1", 9000),
                instance("svc-a", "10.0.0.2", 9000).with_healthy(false),
            ],
        );
        let client = client(&transport);

        let all = client.get_all_instances("svc-a").await.unwrap();
        assert_eq!(all.len(), 2);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_drops_view() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);

        client.subscribe("svc-a").await.unwrap();
        client.subscribe("svc-a").await.unwrap();
        assert_eq!(transport.fetch_calls("svc-a"), 1);

        let key = ServiceKey::new(xnacos_core::DEFAULT_GROUP, "svc-a");
        client.unsubscribe("svc-a").unwrap();
        assert!(client.cache.peek(&key).is_some());
        client.unsubscribe("svc-a").unwrap();
        assert!(client.cache.peek(&key).is_none());
        assert!(!client.subscriptions.contains(&key));

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_refresh_stays_evicted() {
        let transport = Arc::new(FakeTransport::new().with_fetch_delay(Duration::from_secs(1)));
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);
        let key = ServiceKey::new(xnacos_core::DEFAULT_GROUP, "svc-a");

        client.subscribe("svc-a").await.unwrap();

        // Wait for the background refresh of the now stale view
        while !client.refresh.is_in_flight(&key) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        client.unsubscribe("svc-a").unwrap();
        assert!(client.cache.peek(&key).is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!client.refresh.is_in_flight(&key));
        assert!(!client.subscriptions.contains(&key));
        assert!(client.cache.peek(&key).is_none());

        // A later lookup fetches afresh instead of hitting a stranded view
        tokio::time::sleep(Duration::from_secs(400)).await;
        let selected = client.select_one_healthy_instance("svc-a").await.unwrap();
        assert_eq!(selected.ip, "10.0.0.1");

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_keeps_looked_up_service() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);
        let key = ServiceKey::new(xnacos_core::DEFAULT_GROUP, "svc-a");

        client.select_one_healthy_instance("svc-a").await.unwrap();
        client.unsubscribe("svc-a").unwrap();
        assert!(client.subscriptions.contains(&key));

        client.subscribe("svc-a").await.unwrap();
        client.unsubscribe("svc-a").unwrap();
        assert!(client.subscriptions.contains(&key));
        assert!(client.cache.peek(&key).is_some());

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_retry_budget_outlasts_first_fetch_timeout() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_service("svc-a", Error::Unreachable("connection refused".to_string()));
        let client = client(&transport);

        // 200 + 400 + 800 + 1600ms of backoff alone reaches the 3s deadline
        let err = client.select_one_healthy_instance("svc-a").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_notifications() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);
        let mut changes = client.subscribe_changes();

        client.select_one_healthy_instance("svc-a").await.unwrap();
        let event = changes.recv().await.unwrap();
        assert_eq!(event.key.service_name, "svc-a");
        assert_eq!(event.instance_count, 1);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_after_close_fail() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = client(&transport);
        client.select_one_healthy_instance("svc-a").await.unwrap();

        client.close().await;
        client.close().await;

        assert!(client.is_closed());
        assert_eq!(
            client.select_one_healthy_instance("svc-a").await.unwrap_err(),
            Error::Closed
        );
        assert_eq!(client.subscribe("svc-a").await.unwrap_err(), Error::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_first_fetch_waiter() {
        let transport = Arc::new(FakeTransport::new().with_fetch_delay(Duration::from_secs(2)));
        transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 9000)]);
        let client = Arc::new(client(&transport));

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.select_one_healthy_instance("svc-a").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await;

        assert_eq!(waiter.await.unwrap().unwrap_err(), Error::Closed);
    }
}
