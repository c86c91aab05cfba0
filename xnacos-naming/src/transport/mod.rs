//! Registry transport
//!
//! The client core is protocol-agnostic: it only needs to log in and to list
//! the instances of a service. [`HttpTransport`] speaks the Nacos v1 open API.

pub mod http;

use async_trait::async_trait;

use crate::model::{AuthToken, Credentials, Instance, ServiceKey, Session};
use xnacos_core::Result;

pub use http::HttpTransport;

/// Capability the client needs from a registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NamingTransport: Send + Sync {
    /// Exchange credentials for an access token.
    ///
    /// Fails with `Error::Auth` on rejected credentials and
    /// `Error::Unreachable` on network failures.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken>;

    /// List every instance registered under `key`, healthy or not.
    ///
    /// An unknown service yields an empty list.
    async fn fetch_instances(&self, session: &Session, key: &ServiceKey) -> Result<Vec<Instance>>;
}
