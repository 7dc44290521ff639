use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RecordKind, ShardError, StoreError};
use crate::model::{
    Host, HostId, HostQueueEntry, HqeId, Job, JobId, Label, LabelId, Shard, ShardId, User, UserId,
};
use crate::store::{HostBundle, JobBundle, JobFilter, LocalStore};

/// Reply half of a heartbeat.
///
/// Records stay as raw JSON until they are applied, so that one malformed
/// record is rejected on its own instead of failing the whole reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub hosts: Vec<Value>,
    #[serde(default)]
    pub jobs: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: LabelId,
    pub name: String,
    #[serde(default)]
    pub platform: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: ShardId,
    pub hostname: String,
    #[serde(default)]
    pub labels: Vec<LabelRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HqeRecord {
    pub id: HqeId,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub host_id: Option<HostId>,
    pub status: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub aborted: bool,
}

/// A host with its labels and shard embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub hostname: String,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub leased: bool,
    #[serde(default)]
    pub locked: bool,
    pub status: String,
    #[serde(default)]
    pub labels: Vec<LabelRecord>,
    #[serde(default)]
    pub shard: Option<ShardRecord>,
}

/// A job with everything needed to run it on the shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub owner: UserRecord,
    #[serde(default)]
    pub priority: i32,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub shard: Option<ShardRecord>,
    #[serde(default)]
    pub dependency_labels: Vec<LabelRecord>,
    #[serde(default)]
    pub hostqueueentry_set: Vec<HqeRecord>,
}

impl From<LabelRecord> for Label {
    fn from(r: LabelRecord) -> Self {
        Label {
            id: r.id,
            name: r.name,
            platform: r.platform,
        }
    }
}

impl ShardRecord {
    fn into_rows(self, labels: &mut Vec<Label>) -> Shard {
        let label_ids = self.labels.iter().map(|l| l.id).collect();
        labels.extend(self.labels.into_iter().map(Label::from));
        Shard {
            id: self.id,
            hostname: self.hostname,
            labels: label_ids,
        }
    }
}

impl HostRecord {
    pub fn into_bundle(self) -> HostBundle {
        let label_ids = self.labels.iter().map(|l| l.id).collect();
        let mut labels: Vec<Label> = self.labels.into_iter().map(Label::from).collect();
        let shard = self.shard.map(|s| s.into_rows(&mut labels));
        HostBundle {
            host: Host {
                id: self.id,
                hostname: self.hostname,
                invalid: self.invalid,
                leased: self.leased,
                locked: self.locked,
                status: self.status,
                labels: label_ids,
                shard: shard.as_ref().map(|s| s.id),
            },
            labels,
            shard,
        }
    }
}

impl JobRecord {
    /// Flatten into rows. Fails if a nested queue entry names another job.
    pub fn into_bundle(self) -> Result<JobBundle, String> {
        let job_id = self.id;
        let hqes = self
            .hostqueueentry_set
            .into_iter()
            .map(|r| match r.job_id {
                Some(other) if other != job_id => Err(format!(
                    "queue entry {} belongs to job {}, not {}",
                    r.id, other, job_id
                )),
                _ => Ok(HostQueueEntry {
                    id: r.id,
                    job_id,
                    host_id: r.host_id,
                    status: r.status,
                    active: r.active,
                    complete: r.complete,
                    aborted: r.aborted,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dependency_labels = self.dependency_labels.iter().map(|l| l.id).collect();
        let mut labels: Vec<Label> = self
            .dependency_labels
            .into_iter()
            .map(Label::from)
            .collect();
        let shard = self.shard.map(|s| s.into_rows(&mut labels));

        Ok(JobBundle {
            job: Job {
                id: job_id,
                name: self.name,
                owner: self.owner.login.clone(),
                priority: self.priority,
                created_on: self.created_on,
                dependency_labels,
                shard: shard.as_ref().map(|s| s.id),
            },
            hqes,
            labels,
            owner: Some(User {
                id: self.owner.id,
                login: self.owner.login,
            }),
            shard,
        })
    }
}

/// A record from a response that could not be applied.
#[derive(Debug)]
pub struct RecordFailure {
    pub kind: RecordKind,
    pub id: Option<u64>,
    pub error: ShardError,
}

/// Outcome of applying one response.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub hosts_received: usize,
    pub jobs_received: usize,
    pub hosts_applied: usize,
    pub jobs_applied: usize,
    pub failures: Vec<RecordFailure>,
    /// Jobs the master sent that were already complete here and were handed
    /// back for upload.
    pub resynced: Vec<JobId>,
}

fn record_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: RecordKind,
    value: &Value,
) -> Result<T, ShardError> {
    T::deserialize(value).map_err(|e| ShardError::Deserialization {
        kind,
        id: record_id(value),
        reason: e.to_string(),
    })
}

/// Persists a heartbeat response into the local store.
///
/// Every record is written in its own transaction. A record that fails to
/// decode or to commit is logged and skipped, and its siblings still apply.
/// Nothing is ever deleted.
pub struct ResponseApplier<'a, S: LocalStore> {
    store: &'a mut S,
}

impl<'a, S: LocalStore> ResponseApplier<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    /// Apply hosts first, since queue entries of incoming jobs may reference
    /// them, then jobs, then re-sync jobs that already finished here.
    ///
    /// Only the final re-sync update can fail the call; per-record errors are
    /// collected in the report.
    pub fn apply(&mut self, response: &HeartbeatResponse) -> Result<ApplyReport, ShardError> {
        let mut report = ApplyReport {
            hosts_received: response.hosts.len(),
            jobs_received: response.jobs.len(),
            ..Default::default()
        };

        for value in &response.hosts {
            match self.apply_host(value) {
                Ok(()) => report.hosts_applied += 1,
                Err(error) => Self::record_failure(&mut report, RecordKind::Host, value, error),
            }
        }

        for value in &response.jobs {
            match self.apply_job(value) {
                Ok(()) => report.jobs_applied += 1,
                Err(error) => Self::record_failure(&mut report, RecordKind::Job, value, error),
            }
        }

        let job_ids: Vec<JobId> = response
            .jobs
            .iter()
            .filter_map(record_id)
            .map(JobId)
            .collect();
        tracing::info!(jobs = ?job_ids, "Heartbeat response contains jobs");

        // The master sent jobs this shard already finished, so an earlier
        // upload or heartbeat was lost. Clearing the shard queues them for
        // upload again on the next tick.
        let finished = self.store.job_ids(&JobFilter::CompleteAmong(job_ids))?;
        if !finished.is_empty() {
            self.store.update_job_shard(&finished, None)?;
            tracing::info!(jobs = ?finished, "Re-syncing jobs already complete on shard");
        }
        report.resynced = finished;

        Ok(report)
    }

    fn apply_host(&mut self, value: &Value) -> Result<(), ShardError> {
        let record: HostRecord = decode(RecordKind::Host, value)?;
        let id = record.id;
        self.store
            .upsert_host(record.into_bundle())
            .map_err(|source| ShardError::RecordStore {
                kind: RecordKind::Host,
                id: Some(id.0),
                source,
            })
    }

    fn apply_job(&mut self, value: &Value) -> Result<(), ShardError> {
        let record: JobRecord = decode(RecordKind::Job, value)?;
        let id = record.id;
        let bundle = record
            .into_bundle()
            .map_err(|reason| ShardError::Deserialization {
                kind: RecordKind::Job,
                id: Some(id.0),
                reason,
            })?;
        self.store.upsert_job(bundle).map_err(|e| match e {
            StoreError::MissingDependency { .. } => ShardError::Deserialization {
                kind: RecordKind::Job,
                id: Some(id.0),
                reason: e.to_string(),
            },
            source => ShardError::RecordStore {
                kind: RecordKind::Job,
                id: Some(id.0),
                source,
            },
        })
    }

    fn record_failure(report: &mut ApplyReport, kind: RecordKind, value: &Value, error: ShardError) {
        let id = record_id(value);
        tracing::warn!(kind = %kind, id = ?id, error = %error, "Skipping record from heartbeat response");
        report.failures.push(RecordFailure { kind, id, error });
    }
}
