//! Nacos v1 open API over HTTP
//!
//! - `POST {context}/v1/auth/login` exchanges username/password for an access token
//! - `GET {context}/v1/ns/instance/list` lists the instances of a service
//!
//! Status mapping: 401/403 are authentication failures, 5xx and connection
//! errors are transient, 404 on the list endpoint means the service has no
//! registered instances.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::NamingTransport;
use crate::model::{AuthToken, Credentials, Instance, ServiceKey, Session};
use xnacos_core::config::RegistryConfig;
use xnacos_core::{Error, Result};

/// Token lifetime assumed when the registry omits `tokenTtl`
const DEFAULT_TOKEN_TTL_SECS: u64 = 18_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    #[serde(default)]
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostEntry {
    #[serde(default)]
    instance_id: Option<String>,
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    healthy: bool,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    cluster_name: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

const fn default_weight() -> f64 {
    1.0
}

const fn default_enabled() -> bool {
    true
}

impl HostEntry {
    fn into_instance(self, service_name: &str) -> Instance {
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("{}#{}", self.ip, self.port));
        Instance {
            instance_id,
            service_name: service_name.to_string(),
            ip: self.ip,
            port: self.port,
            weight: self.weight,
            healthy: self.healthy,
            enabled: self.enabled,
            cluster_name: self.cluster_name.unwrap_or_else(|| "DEFAULT".to_string()),
            metadata: self.metadata,
            last_updated: Utc::now(),
        }
    }
}

/// HTTP transport for a single Nacos server
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(registry: &RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(registry.request_timeout())
            .connect_timeout(registry.request_timeout().min(Duration::from_secs(3)))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: registry.base_url(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl NamingTransport for HttpTransport {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken> {
        let url = format!("{}/v1/auth/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| map_request_error(&e, "login"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "login"));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Invalid login response: {e}")))?;

        debug!(username = %credentials.username, ttl_secs = ?login.token_ttl, "Registry login succeeded");

        Ok(AuthToken {
            access_token: login.access_token,
            ttl: Duration::from_secs(login.token_ttl.unwrap_or(DEFAULT_TOKEN_TTL_SECS)),
        })
    }

    async fn fetch_instances(&self, session: &Session, key: &ServiceKey) -> Result<Vec<Instance>> {
        let url = format!("{}/v1/ns/instance/list", self.base_url);
        let mut query = vec![
            ("serviceName", key.service_name.as_str()),
            ("groupName", key.group.as_str()),
            ("namespaceId", session.namespace_id.as_str()),
            ("healthyOnly", "false"),
        ];
        if let Some(token) = session.token.as_deref() {
            query.push(("accessToken", token));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| map_request_error(&e, "instance list"))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(service = %key, "Registry does not know the service");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "instance list"));
        }

        let list: InstanceListResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Invalid instance list for {key}: {e}")))?;

        Ok(list
            .hosts
            .into_iter()
            .map(|host| host.into_instance(&key.service_name))
            .collect())
    }
}

fn map_request_error(err: &reqwest::Error, what: &str) -> Error {
    if err.is_decode() {
        Error::Protocol(format!("{what}: {err}"))
    } else {
        Error::Unreachable(format!("{what}: {err}"))
    }
}

fn map_status(status: StatusCode, body: &str, what: &str) -> Error {
    let body = body.trim();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("{what} rejected ({status}): {body}"))
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Error::Unreachable(format!("{what} failed ({status}): {body}"))
        }
        _ => Error::Protocol(format!("{what} returned {status}: {body}")),
    }
}
