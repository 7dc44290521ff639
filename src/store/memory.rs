use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{
    Completion, Host, HostId, HostQueueEntry, HqeId, Job, JobId, Label, LabelId, Shard, ShardId,
    User, UserId,
};
use crate::store::{HostBundle, HostFilter, JobBundle, JobFilter, LocalStore};

/// Tables of the local database.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StoreState {
    jobs: BTreeMap<JobId, Job>,
    hqes: BTreeMap<HqeId, HostQueueEntry>,
    hosts: BTreeMap<HostId, Host>,
    labels: BTreeMap<LabelId, Label>,
    users: BTreeMap<UserId, User>,
    shards: BTreeMap<ShardId, Shard>,
}

/// On-disk form of [`StoreState`]. Rows are kept as lists so the file does not
/// depend on how map keys are encoded.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    hqes: Vec<HostQueueEntry>,
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    shards: Vec<Shard>,
}

impl From<&StoreState> for Snapshot {
    fn from(state: &StoreState) -> Self {
        Self {
            jobs: state.jobs.values().cloned().collect(),
            hqes: state.hqes.values().cloned().collect(),
            hosts: state.hosts.values().cloned().collect(),
            labels: state.labels.values().cloned().collect(),
            users: state.users.values().cloned().collect(),
            shards: state.shards.values().cloned().collect(),
        }
    }
}

impl From<Snapshot> for StoreState {
    fn from(snap: Snapshot) -> Self {
        Self {
            jobs: snap.jobs.into_iter().map(|j| (j.id, j)).collect(),
            hqes: snap.hqes.into_iter().map(|h| (h.id, h)).collect(),
            hosts: snap.hosts.into_iter().map(|h| (h.id, h)).collect(),
            labels: snap.labels.into_iter().map(|l| (l.id, l)).collect(),
            users: snap.users.into_iter().map(|u| (u.id, u)).collect(),
            shards: snap.shards.into_iter().map(|s| (s.id, s)).collect(),
        }
    }
}

impl StoreState {
    fn completion(&self, job_id: JobId) -> Completion {
        Completion::of(self.hqes.values().filter(|h| h.job_id == job_id))
    }

    fn completions(&self) -> BTreeMap<JobId, Completion> {
        let mut grouped: BTreeMap<JobId, Vec<&HostQueueEntry>> = BTreeMap::new();
        for hqe in self.hqes.values() {
            grouped.entry(hqe.job_id).or_default().push(hqe);
        }
        self.jobs
            .keys()
            .map(|id| {
                let entries = grouped.get(id).map(Vec::as_slice).unwrap_or(&[]);
                (*id, Completion::of(entries.iter().copied()))
            })
            .collect()
    }

    pub(crate) fn job_ids(&self, filter: &JobFilter) -> Vec<JobId> {
        match filter {
            JobFilter::Incomplete => self
                .completions()
                .into_iter()
                .filter(|(_, c)| *c == Completion::Incomplete)
                .map(|(id, _)| id)
                .collect(),
            JobFilter::ReadyForUpload => self
                .completions()
                .into_iter()
                .filter(|(id, c)| {
                    *c == Completion::Complete
                        && self.jobs.get(id).is_some_and(|job| !job.is_owned())
                })
                .map(|(id, _)| id)
                .collect(),
            JobFilter::CompleteAmong(ids) => {
                let wanted: BTreeSet<JobId> = ids.iter().copied().collect();
                wanted
                    .into_iter()
                    .filter(|id| {
                        self.jobs.contains_key(id) && self.completion(*id) == Completion::Complete
                    })
                    .collect()
            }
        }
    }

    pub(crate) fn host_ids(&self, filter: HostFilter) -> Vec<HostId> {
        self.hosts
            .values()
            .filter(|h| match filter {
                HostFilter::Valid => !h.invalid,
            })
            .map(|h| h.id)
            .collect()
    }

    pub(crate) fn jobs(&self, ids: &[JobId]) -> Vec<Job> {
        ids.iter()
            .filter_map(|id| self.jobs.get(id).cloned())
            .collect()
    }

    pub(crate) fn hqes_for_jobs(&self, job_ids: &[JobId]) -> Vec<HostQueueEntry> {
        let wanted: BTreeSet<JobId> = job_ids.iter().copied().collect();
        self.hqes
            .values()
            .filter(|h| wanted.contains(&h.job_id))
            .cloned()
            .collect()
    }

    pub(crate) fn host(&self, id: HostId) -> Option<Host> {
        self.hosts.get(&id).cloned()
    }

    pub(crate) fn shard_by_hostname(&self, hostname: &str) -> Option<Shard> {
        self.shards
            .values()
            .find(|s| s.hostname == hostname)
            .cloned()
    }

    pub(crate) fn upsert_host(&mut self, bundle: HostBundle) {
        let HostBundle {
            mut host,
            labels,
            shard,
        } = bundle;

        for label in labels {
            self.labels.insert(label.id, label);
        }
        if let Some(shard) = shard {
            self.shards.insert(shard.id, shard);
        }
        // Lease and status are driven by the local scheduler once the host
        // exists here.
        if let Some(existing) = self.hosts.get(&host.id) {
            host.leased = existing.leased;
            host.status = existing.status.clone();
        }
        self.hosts.insert(host.id, host);
    }

    pub(crate) fn upsert_job(&mut self, bundle: JobBundle) -> Result<(), StoreError> {
        for hqe in &bundle.hqes {
            if let Some(host_id) = hqe.host_id {
                if !self.hosts.contains_key(&host_id) {
                    return Err(StoreError::MissingDependency {
                        kind: "host",
                        id: host_id.0,
                        referrer: format!("queue entry {} of job {}", hqe.id, bundle.job.id),
                    });
                }
            }
        }

        let JobBundle {
            job,
            hqes,
            labels,
            owner,
            shard,
        } = bundle;

        for label in labels {
            self.labels.insert(label.id, label);
        }
        if let Some(user) = owner {
            self.users.insert(user.id, user);
        }
        if let Some(shard) = shard {
            self.shards.insert(shard.id, shard);
        }
        for mut hqe in hqes {
            if let Some(local) = self.hqes.get(&hqe.id) {
                // Completion never goes backwards on the shard.
                if local.complete && !hqe.complete {
                    hqe = local.clone();
                }
            }
            self.hqes.insert(hqe.id, hqe);
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub(crate) fn update_job_shard(&mut self, ids: &[JobId], shard: Option<ShardId>) -> usize {
        let mut updated = 0;
        for id in ids {
            if let Some(job) = self.jobs.get_mut(id) {
                job.shard = shard;
                updated += 1;
            }
        }
        updated
    }

    pub(crate) fn finish_job(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        job.shard = None;
        for hqe in self.hqes.values_mut().filter(|h| h.job_id == job_id) {
            hqe.finish();
        }
        true
    }
}

/// Volatile [`LocalStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStore {
    state: StoreState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the local scheduler does when a job finishes: complete every
    /// queue entry and hand ownership back so the job gets uploaded.
    /// Returns false if the job is unknown.
    pub fn finish_job(&mut self, job_id: JobId) -> bool {
        self.state.finish_job(job_id)
    }

    pub fn job_count(&self) -> usize {
        self.state.jobs.len()
    }

    pub fn hqe_count(&self) -> usize {
        self.state.hqes.len()
    }
}

impl LocalStore for MemoryStore {
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
        self.state.upsert_host(bundle);
        Ok(())
    }

    fn upsert_job(&mut self, bundle: JobBundle) -> Result<(), StoreError> {
        self.state.upsert_job(bundle)
    }

    fn update_job_shard(
        &mut self,
        ids: &[JobId],
        shard: Option<ShardId>,
    ) -> Result<usize, StoreError> {
        Ok(self.state.update_job_shard(ids, shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: u64) -> Host {
        Host {
            id: HostId(id),
            hostname: format!("host{}", id),
            invalid: false,
            leased: false,
            locked: false,
            status: "Ready".to_string(),
            labels: vec![LabelId(1)],
            shard: None,
        }
    }

    fn job_bundle(id: u64, shard: Option<u64>, hqes: &[(u64, bool)]) -> JobBundle {
        let job = Job {
            shard: shard.map(ShardId),
            ..Job::new(JobId(id), format!("job{}", id), "debug_user")
        };
        let hqes = hqes
            .iter()
            .map(|&(hqe_id, complete)| HostQueueEntry {
                complete,
                ..HostQueueEntry::queued(HqeId(hqe_id), JobId(id), None)
            })
            .collect();
        JobBundle {
            job,
            hqes,
            labels: Vec::new(),
            owner: None,
            shard: None,
        }
    }

    #[test]
    fn filters_follow_queue_entries() {
        let mut store = MemoryStore::new();
        store.upsert_job(job_bundle(1, None, &[(10, true)])).unwrap();
        store.upsert_job(job_bundle(2, Some(5), &[(20, true)])).unwrap();
        store
            .upsert_job(job_bundle(3, None, &[(30, true), (31, false)]))
            .unwrap();
        store.upsert_job(job_bundle(4, None, &[])).unwrap();

        assert_eq!(store.job_ids(&JobFilter::Incomplete).unwrap(), vec![JobId(3)]);
        assert_eq!(
            store.job_ids(&JobFilter::ReadyForUpload).unwrap(),
            vec![JobId(1)]
        );
        assert_eq!(
            store
                .job_ids(&JobFilter::CompleteAmong(vec![JobId(3), JobId(2), JobId(99)]))
                .unwrap(),
            vec![JobId(2)]
        );
    }

    #[test]
    fn invalid_hosts_are_filtered() {
        let mut store = MemoryStore::new();
        store
            .upsert_host(HostBundle {
                host: host(1),
                labels: Vec::new(),
                shard: None,
            })
            .unwrap();
        store
            .upsert_host(HostBundle {
                host: Host {
                    invalid: true,
                    ..host(2)
                },
                labels: Vec::new(),
                shard: None,
            })
            .unwrap();

        assert_eq!(store.host_ids(HostFilter::Valid).unwrap(), vec![HostId(1)]);
        assert!(store.host(HostId(2)).unwrap().unwrap().invalid);
    }

    #[test]
    fn host_update_keeps_local_lease() {
        let mut store = MemoryStore::new();
        let mut leased = host(1);
        leased.leased = true;
        leased.status = "Running".to_string();
        store
            .upsert_host(HostBundle {
                host: leased,
                labels: Vec::new(),
                shard: None,
            })
            .unwrap();

        let mut update = host(1);
        update.locked = true;
        store
            .upsert_host(HostBundle {
                host: update,
                labels: Vec::new(),
                shard: None,
            })
            .unwrap();

        let stored = store.host(HostId(1)).unwrap().unwrap();
        assert!(stored.leased);
        assert!(stored.locked);
        assert_eq!(stored.status, "Running");
    }

    #[test]
    fn missing_host_rejects_whole_job() {
        let mut store = MemoryStore::new();
        let mut bundle = job_bundle(1, Some(5), &[(10, false)]);
        bundle.hqes[0].host_id = Some(HostId(7));

        let err = store.upsert_job(bundle).unwrap_err();
        assert!(matches!(
            err,
            StoreError::MissingDependency { kind: "host", id: 7, .. }
        ));
        assert_eq!(store.job_count(), 0);
        assert_eq!(store.hqe_count(), 0);
    }

    #[test]
    fn completion_is_not_reverted_by_upsert() {
        let mut store = MemoryStore::new();
        store
            .upsert_job(job_bundle(1, Some(5), &[(10, false)]))
            .unwrap();
        assert!(store.finish_job(JobId(1)));

        store
            .upsert_job(job_bundle(1, Some(5), &[(10, false)]))
            .unwrap();

        let hqes = store.hqes_for_jobs(&[JobId(1)]).unwrap();
        assert!(hqes[0].complete);
        assert_eq!(hqes[0].status, "Completed");
    }

    #[test]
    fn finish_job_clears_shard() {
        let mut store = MemoryStore::new();
        store
            .upsert_job(job_bundle(1, Some(5), &[(10, false), (11, false)]))
            .unwrap();
        assert!(store.finish_job(JobId(1)));
        assert!(!store.finish_job(JobId(2)));

        let job = &store.jobs(&[JobId(1)]).unwrap()[0];
        assert_eq!(job.shard, None);
        assert_eq!(
            store.job_ids(&JobFilter::ReadyForUpload).unwrap(),
            vec![JobId(1)]
        );
    }

    #[test]
    fn update_job_shard_counts_known_rows() {
        let mut store = MemoryStore::new();
        store.upsert_job(job_bundle(1, None, &[(10, true)])).unwrap();
        let updated = store
            .update_job_shard(&[JobId(1), JobId(2)], Some(ShardId(5)))
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.jobs(&[JobId(1)]).unwrap()[0].shard, Some(ShardId(5)));
    }

    #[test]
    fn snapshot_round_trip_preserves_tables() {
        let mut state = StoreState::default();
        state.upsert_job(job_bundle(1, Some(5), &[(10, true)])).unwrap();
        state.upsert_host(HostBundle {
            host: host(3),
            labels: vec![Label {
                id: LabelId(1),
                name: "board:lumpy".to_string(),
                platform: true,
            }],
            shard: Some(Shard {
                id: ShardId(5),
                hostname: "shard1".to_string(),
                labels: vec![LabelId(1)],
            }),
        });

        let json = serde_json::to_string(&Snapshot::from(&state)).unwrap();
        let restored = StoreState::from(serde_json::from_str::<Snapshot>(&json).unwrap());
        assert_eq!(restored, state);
    }
}
