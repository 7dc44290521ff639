use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::model::{Host, HostId, HostQueueEntry, Job, JobId, Shard, ShardId};
use crate::store::memory::{Snapshot, StoreState};
use crate::store::{HostBundle, HostFilter, JobBundle, JobFilter, LocalStore};

/// [`LocalStore`] persisted as a JSON snapshot.
///
/// Every committed write rewrites the snapshot through a temporary file and a
/// rename, so a crash leaves either the old or the new state on disk. If the
/// write fails the in-memory state is rolled back and the transaction fails.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: StoreState,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(bytes) => StoreState::from(serde_json::from_slice::<Snapshot>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), "Opened local store");
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// See [`MemoryStore::finish_job`](crate::store::MemoryStore::finish_job).
    pub fn finish_job(&mut self, job_id: JobId) -> Result<bool, StoreError> {
        self.commit(|state| Ok(state.finish_job(job_id)))
    }

    fn commit<T>(
        &mut self,
        apply: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let before = self.state.clone();
        let result = apply(&mut self.state).and_then(|value| {
            self.persist()?;
            Ok(value)
        });
        if result.is_err() {
            self.state = before;
        }
        result
    }

    fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&Snapshot::from(&self.state))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn job_ids(&self, filter: &JobFilter) -> Result<Vec<JobId>, StoreError> {
        Ok(self.state.job_ids(filter))
    }

    fn host_ids(&self, filter: HostFilter) -> Result<Vec<HostId>, StoreError> {
        Ok(self.state.host_ids(filter))
    }

    fn jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.jobs(ids))
    }

    fn hqes_for_jobs(&self, job_ids: &[JobId]) -> Result<Vec<HostQueueEntry>, StoreError> {
        Ok(self.state.hqes_for_jobs(job_ids))
    }

    fn host(&self, id: HostId) -> Result<Option<Host>, StoreError> {
        Ok(self.state.host(id))
    }

    fn shard_by_hostname(&self, hostname: &str) -> Result<Option<Shard>, StoreError> {
        Ok(self.state.shard_by_hostname(hostname))
    }

    fn upsert_host(&mut self, bundle: HostBundle) -> Result<(), StoreError> {
        self.commit(|state| {
            state.upsert_host(bundle);
            Ok(())
        })
    }

    fn upsert_job(&mut self, bundle: JobBundle) -> Result<(), StoreError> {
        self.commit(|state| state.upsert_job(bundle))
    }

    fn update_job_shard(
        &mut self,
        ids: &[JobId],
        shard: Option<ShardId>,
    ) -> Result<usize, StoreError> {
        self.commit(|state| Ok(state.update_job_shard(ids, shard)))
    }
}
