use crate::error::StoreError;
use crate::model::Shard;
use crate::store::LocalStore;

/// This shard's own record, looked up by hostname.
///
/// The record arrives from the master together with the first jobs, so it is
/// missing on a fresh shard. That is fine: without jobs there is nothing to
/// mark as uploaded. Only a successful lookup is cached.
#[derive(Debug, Clone)]
pub struct ShardIdentity {
    hostname: String,
    cached: Option<Shard>,
}

impl ShardIdentity {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            cached: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns `None` while no shard record exists locally.
    pub fn resolve<S: LocalStore>(&mut self, store: &S) -> Result<Option<&Shard>, StoreError> {
        if self.cached.is_none() {
            self.cached = store.shard_by_hostname(&self.hostname)?;
            if let Some(shard) = &self.cached {
                tracing::debug!(shard_id = %shard.id, hostname = %shard.hostname, "Resolved shard record");
            }
        }
        Ok(self.cached.as_ref())
    }
}
