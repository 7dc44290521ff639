use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ShardError};
use crate::heartbeat::RetryPolicy;

/// Settings of the shard client.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Hostname (or URL) of the master AFE.
    pub global_afe_hostname: String,
    /// This shard's hostname, as registered on the master. Only shards have
    /// one; the client refuses to start without it.
    pub shard_hostname: Option<String>,
    /// Pause between the end of one heartbeat and the start of the next.
    pub heartbeat_pause: Duration,
    pub retry: RetryPolicy,
    /// Location of the local store. `None` keeps the store in memory.
    pub store_path: Option<PathBuf>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            global_afe_hostname: "cautotest".to_string(),
            shard_hostname: None,
            heartbeat_pause: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            store_path: None,
        }
    }
}

impl ShardConfig {
    pub fn new(global_afe_hostname: impl Into<String>, shard_hostname: impl Into<String>) -> Self {
        Self {
            global_afe_hostname: global_afe_hostname.into(),
            shard_hostname: Some(shard_hostname.into()),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_pause(mut self, pause: Duration) -> Self {
        self.heartbeat_pause = pause;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// The shard hostname, or a configuration error when not running as a
    /// shard.
    pub fn shard_hostname(&self) -> Result<&str> {
        match self.shard_hostname.as_deref() {
            Some(hostname) if !hostname.trim().is_empty() => Ok(hostname),
            _ => Err(ShardError::Configuration(
                "To run the shard client, shard_hostname must neither be None nor empty."
                    .to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.shard_hostname()?;
        if self.global_afe_hostname.trim().is_empty() {
            return Err(ShardError::Configuration(
                "global_afe_hostname must not be empty.".to_string(),
            ));
        }
        if self.retry.timeout.is_zero() {
            return Err(ShardError::Configuration(
                "RPC timeout must be greater than zero.".to_string(),
            ));
        }
        Ok(())
    }
}
