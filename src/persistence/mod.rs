//! Persistence layer - SQLite log store and the JSON instance state file

mod database;
mod pattern;
mod retry;
mod state;

pub use database::LogStore;
pub use retry::RetryPolicy;
pub use state::InstanceStateStore;
