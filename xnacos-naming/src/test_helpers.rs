//! Test helpers and fixtures for xnacos-naming tests
//!
//! [`FakeTransport`] is a scripted in-memory registry that counts every call,
//! so tests can assert on deduplication and retry behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::{AuthToken, Credentials, Instance, ServiceKey, Session};
use crate::transport::NamingTransport;
use xnacos_core::{Config, Error, Result};

/// Valid client configuration pointing at `127.0.0.1:8848`, namespace `test`
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.registry.ip_addr = "127.0.0.1".to_string();
    config.registry.port = 8848;
    config.registry.namespace_id = Some("test".to_string());
    config
}

/// Healthy instance of `service_name` with weight 1
#[must_use]
pub fn instance(service_name: &str, ip: &str, port: u16) -> Instance {
    Instance::new(service_name, ip, port)
}

/// Scripted registry
pub struct FakeTransport {
    services: Mutex<HashMap<String, Result<Vec<Instance>>>>,
    login_delay: Duration,
    fetch_delay: Duration,
    token_ttl: Duration,
    reject_logins: AtomicBool,
    login_calls: AtomicUsize,
    fetch_calls: Mutex<HashMap<String, usize>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            login_delay: Duration::ZERO,
            fetch_delay: Duration::ZERO,
            token_ttl: Duration::from_secs(3600),
            reject_logins: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            fetch_calls: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Answer fetches of `service_name` (any group) with `instances`
    pub fn set_instances(&self, service_name: &str, instances: Vec<Instance>) {
        self.services
            .lock()
            .insert(service_name.to_string(), Ok(instances));
    }

    /// Fail every later fetch of `service_name` with `error`
    pub fn fail_service(&self, service_name: &str, error: Error) {
        self.services
            .lock()
            .insert(service_name.to_string(), Err(error));
    }

    pub fn reject_logins(&self, reject: bool) {
        self.reject_logins.store(reject, Ordering::SeqCst);
    }

    #[must_use]
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn fetch_calls(&self, service_name: &str) -> usize {
        self.fetch_calls
            .lock()
            .get(service_name)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl NamingTransport for FakeTransport {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst);
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        if self.reject_logins.load(Ordering::SeqCst) {
            return Err(Error::Auth(format!("unknown user {}", credentials.username)));
        }
        Ok(AuthToken {
            access_token: format!("token-{n}"),
            ttl: self.token_ttl,
        })
    }

    async fn fetch_instances(&self, _session: &Session, key: &ServiceKey) -> Result<Vec<Instance>> {
        *self
            .fetch_calls
            .lock()
            .entry(key.service_name.clone())
            .or_default() += 1;
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let answer = self.services.lock().get(&key.service_name).cloned();
        answer.unwrap_or_else(|| Ok(Vec::new()))
    }
}
