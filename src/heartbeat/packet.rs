use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{HostId, HostQueueEntry, Job, JobId};
use crate::store::{HostFilter, JobFilter, LocalStore};

/// Request half of a heartbeat, built fresh every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    pub shard_hostname: String,
    pub known_job_ids: Vec<JobId>,
    pub known_host_ids: Vec<HostId>,
    /// Finished jobs, leaf rows only.
    pub jobs: Vec<Job>,
    /// Queue entries of `jobs`, leaf rows only.
    pub hqes: Vec<HostQueueEntry>,
}

impl HeartbeatPacket {
    pub fn uploaded_job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }
}

/// Reads the local store and assembles the heartbeat request. Never writes.
pub struct PacketBuilder<'a, S: LocalStore> {
    store: &'a S,
}

impl<'a, S: LocalStore> PacketBuilder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Jobs the shard still works on. Finished jobs are left out: the master
    /// never re-sends them, and it reads their absence as "the shard has the
    /// final state".
    pub fn known_job_ids(&self) -> Result<Vec<JobId>, StoreError> {
        self.store.job_ids(&JobFilter::Incomplete)
    }

    /// Invalid hosts count as absent so the master may offer the hostname
    /// again.
    pub fn known_host_ids(&self) -> Result<Vec<HostId>, StoreError> {
        self.store.host_ids(HostFilter::Valid)
    }

    /// Jobs with no owning shard whose queue entries are all complete.
    ///
    /// Both conditions are required: a null shard alone also describes jobs
    /// that were never run, and uploading those would report them finished.
    pub fn jobs_to_upload(&self) -> Result<Vec<Job>, StoreError> {
        let ids = self.store.job_ids(&JobFilter::ReadyForUpload)?;
        self.store.jobs(&ids)
    }

    pub fn build_packet(&self, shard_hostname: &str) -> Result<HeartbeatPacket, StoreError> {
        let known_job_ids = self.known_job_ids()?;
        let known_host_ids = self.known_host_ids()?;
        tracing::info!(known_jobs = ?known_job_ids, "Known jobs");

        let jobs = self.jobs_to_upload()?;
        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let hqes = self.store.hqes_for_jobs(&job_ids)?;
        tracing::info!(uploading = ?job_ids, "Uploading jobs");

        Ok(HeartbeatPacket {
            shard_hostname: shard_hostname.to_string(),
            known_job_ids,
            known_host_ids,
            jobs,
            hqes,
        })
    }
}
