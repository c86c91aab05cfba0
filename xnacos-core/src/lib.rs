pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;

pub use config::{Config, DEFAULT_GROUP};
pub use error::{Error, Result};
pub use resilience::RetryPolicy;
