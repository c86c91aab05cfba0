//! Instance selection, subscriptions and background refresh

pub mod refresh;
pub mod selector;
pub mod subscription;

pub use refresh::{FetchState, RefreshCoordinator, RefreshHandle};
pub use selector::HealthSelector;
pub use subscription::SubscriptionRegistry;
