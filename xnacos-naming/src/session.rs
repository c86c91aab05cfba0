//! Registry session management
//!
//! Keeps one session per client. Readers take a cheap snapshot of the current
//! session; logins are serialized behind an async gate so concurrent callers
//! that find the token expiring trigger exactly one login.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{Credentials, Session};
use crate::transport::NamingTransport;
use xnacos_core::resilience::{retry, RetryPolicy};
use xnacos_core::{Error, Result};

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub namespace_id: String,
    /// `None` runs anonymously against a registry without auth
    pub credentials: Option<Credentials>,
    /// Re-authenticate when the token expires within this window
    pub grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8848".to_string(),
            namespace_id: String::new(),
            credentials: None,
            grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Owner of the registry session
pub struct ConnectionManager {
    transport: Arc<dyn NamingTransport>,
    config: SessionConfig,
    current: RwLock<Option<Session>>,
    login_gate: Mutex<()>,
    closed: AtomicBool,
    logins: AtomicU64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn NamingTransport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            current: RwLock::new(None),
            login_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            logins: AtomicU64::new(0),
        }
    }

    /// Return a session that is valid beyond the grace window, logging in if needed
    pub async fn ensure_session(&self) -> Result<Session> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(session) = self.usable_session() {
            return Ok(session);
        }

        let _gate = self.login_gate.lock().await;

        // Another caller may have logged in while we waited
        if let Some(session) = self.usable_session() {
            return Ok(session);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let session = self.login().await?;
        *self.current.write() = Some(session.clone());
        Ok(session)
    }

    /// Run a registry call with a live session.
    ///
    /// If the registry rejects the token, the session is dropped and the call
    /// is retried once after a fresh login.
    pub async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.ensure_session().await?;
        match op(session.clone()).await {
            Err(Error::Auth(reason)) if self.config.credentials.is_some() => {
                warn!(
                    endpoint = %self.config.endpoint,
                    reason = %reason,
                    "Registry rejected session token, re-authenticating"
                );
                self.invalidate(&session);
                let fresh = self.ensure_session().await?;
                op(fresh).await
            }
            other => other,
        }
    }

    /// Drop `stale` if it is still the current session
    pub fn invalidate(&self, stale: &Session) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|s| s.token == stale.token) {
            *current = None;
        }
    }

    /// Release the session; later calls fail with `Error::Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.current.write().take();
        debug!(endpoint = %self.config.endpoint, "Registry session released");
    }

    /// Number of logins performed so far
    #[must_use]
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    fn usable_session(&self) -> Option<Session> {
        self.current
            .read()
            .as_ref()
            .filter(|s| !s.expires_within(self.config.grace))
            .cloned()
    }

    async fn login(&self) -> Result<Session> {
        let Some(credentials) = self.config.credentials.as_ref() else {
            return Ok(Session {
                endpoint: self.config.endpoint.clone(),
                namespace_id: self.config.namespace_id.clone(),
                token: None,
                expires_at: None,
            });
        };

        let token = retry(&self.config.retry, "login", || {
            self.transport.authenticate(credentials)
        })
        .await?;
        self.logins.fetch_add(1, Ordering::Relaxed);

        if token.ttl <= self.config.grace {
            warn!(
                ttl = ?token.ttl,
                grace = ?self.config.grace,
                "Token lifetime is inside the grace window; every call will log in again"
            );
        }

        info!(
            endpoint = %self.config.endpoint,
            namespace = %self.config.namespace_id,
            ttl = ?token.ttl,
            "Authenticated with registry"
        );

        Ok(Session {
            endpoint: self.config.endpoint.clone(),
            namespace_id: self.config.namespace_id.clone(),
            token: Some(token.access_token),
            expires_at: Some(Instant::now() + token.ttl),
        })
    }
}
