mod ops;

// The query modules stay private; the flat re-exports below are the crate's
// public surface.

// Types
mod types;
pub use types::Job;
pub use types::JobFilter;
pub use types::JobInit;
pub use types::JobState;
pub use types::Outcome;

// Errors
mod error;
pub use error::QueueError;

// Store
mod store;
pub use store::Store;

// Retry policy
mod retry;
pub use retry::Disposition;
pub use retry::RetryPolicy;

// Config
mod config;
pub use config::StoreConfig;
pub use config::CONFIG_BACKOFF_BASE;
pub use config::CONFIG_MAX_RETRIES;
pub use config::DEFAULT_BACKOFF_BASE;
pub use config::DEFAULT_MAX_RETRIES;
pub use config::STORE_FILE;
