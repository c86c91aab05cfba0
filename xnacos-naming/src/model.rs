//! Instances, service views and registry sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// One network endpoint registered under a service name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    /// Disabled instances stay listed but never take traffic
    pub enabled: bool,
    pub cluster_name: String,
    pub metadata: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

impl Instance {
    #[must_use]
    pub fn new(service_name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        Self {
            instance_id: format!("{ip}#{port}"),
            service_name: service_name.into(),
            ip,
            port,
            weight: 1.0,
            healthy: true,
            enabled: true,
            cluster_name: "DEFAULT".to_string(),
            metadata: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub const fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    /// `ip:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Healthy and enabled
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.healthy && self.enabled
    }

    /// Weight usable for proportional selection
    #[must_use]
    pub fn has_positive_weight(&self) -> bool {
        self.weight.is_finite() && self.weight > 0.0
    }

    /// Equal in everything the registry reports, ignoring `last_updated`
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
            && self.service_name == other.service_name
            && self.ip == other.ip
            && self.port == other.port
            && self.weight.to_bits() == other.weight.to_bits()
            && self.healthy == other.healthy
            && self.enabled == other.enabled
            && self.cluster_name == other.cluster_name
            && self.metadata == other.metadata
    }
}

/// A service name scoped by its group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub group: String,
    pub service_name: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(group: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@@{}", self.group, self.service_name)
    }
}

/// Last-known instance set of one service
#[derive(Debug, Clone)]
pub struct ServiceView {
    pub key: ServiceKey,
    pub instances: Vec<Instance>,
    pub fetched_at: Instant,
    pub ttl: Duration,
    /// Advances only when the instance set changes
    pub revision: u64,
}

impl ServiceView {
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.age() > self.ttl
    }

    /// The registry reported zero instances
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Login credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token issued by the registry's login endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub ttl: Duration,
}

/// An authenticated (or anonymous) registry session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub endpoint: String,
    pub namespace_id: String,
    /// `None` when the registry runs without authentication
    pub token: Option<String>,
    /// `None` never expires
    pub expires_at: Option<Instant>,
}

impl Session {
    /// Expired, or expiring within `grace`
    #[must_use]
    pub fn expires_within(&self, grace: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at.saturating_duration_since(Instant::now()) <= grace)
    }
}
