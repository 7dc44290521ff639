//! The shard's local database.
//!
//! The heartbeat engine only talks to the database through [`LocalStore`]:
//! filtered id reads, hydrated record reads, one transaction per upserted
//! record, and a bulk update of the `shard` field.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: volatile, used by tests and embedders
//! - [`FileStore`]: the same engine, snapshotted to disk after every commit
//!
//! Both expose [`finish_job`](MemoryStore::finish_job), the one write the
//! local scheduler performs that the heartbeat depends on.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::model::{Host, HostId, HostQueueEntry, Job, JobId, Label, Shard, ShardId, User};

/// Predicates over jobs, evaluated against their queue entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    /// Jobs with at least one incomplete queue entry.
    Incomplete,
    /// Jobs with `shard == None` whose queue entries are all complete.
    ReadyForUpload,
    /// The subset of `ids` whose queue entries are all complete.
    CompleteAmong(Vec<JobId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFilter {
    /// Hosts not flagged invalid.
    Valid,
}

/// A host together with the rows it depends on, written in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBundle {
    pub host: Host,
    pub labels: Vec<Label>,
    pub shard: Option<Shard>,
}

/// A job together with its queue entries and dependencies, written in one
/// transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct JobBundle {
    pub job: Job,
    pub hqes: Vec<HostQueueEntry>,
    pub labels: Vec<Label>,
    pub owner: Option<User>,
    pub shard: Option<Shard>,
}

pub trait LocalStore: Send {
    /// Ids of the jobs matching `filter`, in ascending order.
    fn job_ids(&self, filter: &JobFilter) -> Result<Vec<JobId>, StoreError>;

    /// Ids of the hosts matching `filter`, in ascending order.
    fn host_ids(&self, filter: HostFilter) -> Result<Vec<HostId>, StoreError>;

    /// Job rows for `ids`. Unknown ids are skipped.
    fn jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError>;

    /// Queue entries belonging to any of `job_ids`, ordered by entry id.
    fn hqes_for_jobs(&self, job_ids: &[JobId]) -> Result<Vec<HostQueueEntry>, StoreError>;

    fn host(&self, id: HostId) -> Result<Option<Host>, StoreError>;

    fn shard_by_hostname(&self, hostname: &str) -> Result<Option<Shard>, StoreError>;

    /// Insert or update a host and its dependencies atomically.
    fn upsert_host(&mut self, bundle: HostBundle) -> Result<(), StoreError>;

    /// Insert or update a job, its queue entries and dependencies atomically.
    ///
    /// Fails with [`StoreError::MissingDependency`] without writing anything
    /// when a queue entry names a host the store does not have.
    fn upsert_job(&mut self, bundle: JobBundle) -> Result<(), StoreError>;

    /// Set `shard` on every job in `ids`. Returns the number of rows changed.
    fn update_job_shard(
        &mut self,
        ids: &[JobId],
        shard: Option<ShardId>,
    ) -> Result<usize, StoreError>;
}
