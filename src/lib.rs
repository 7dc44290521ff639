pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod shutdown;
pub mod store;

pub use client::{ShardClient, SyncState, TickReport};
pub use config::ShardConfig;
pub use error::{Result, ShardError};
