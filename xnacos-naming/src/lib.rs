pub mod cache;
pub mod client;
pub mod discovery;
pub mod model;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

pub use cache::{CacheEvent, InstanceCache};
pub use client::{NamingClient, SelectParams};
pub use discovery::{HealthSelector, RefreshCoordinator, RefreshHandle, SubscriptionRegistry};
pub use model::{Instance, ServiceKey, ServiceView};
pub use session::{ConnectionManager, SessionConfig};
pub use transport::{HttpTransport, NamingTransport};
pub use xnacos_core::{Config, Error, Result};
