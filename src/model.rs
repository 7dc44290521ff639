//! Row types for the shard's local database.
//!
//! These are the *leaf* forms of the records: foreign keys are stored as ids.
//! The nested forms the master sends (records with their dependencies
//! embedded) live in [`crate::heartbeat::response`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Primary key of a job, shared between master and shards.
    JobId
);
id_type!(
    /// Primary key of a host.
    HostId
);
id_type!(
    /// Primary key of a host-queue-entry.
    HqeId
);
id_type!(LabelId);
id_type!(UserId);
id_type!(
    /// Primary key of a shard record.
    ShardId
);

/// A job as stored locally.
///
/// `shard` carries two meanings at once. While it names a shard, the job is
/// owned by that shard and must not be uploaded. Once the local scheduler
/// finishes the job it clears the field, which marks the job ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub priority: i32,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub dependency_labels: Vec<LabelId>,
    pub shard: Option<ShardId>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            priority: 0,
            created_on: Utc::now(),
            dependency_labels: Vec::new(),
            shard: None,
        }
    }

    pub fn with_shard(mut self, shard: ShardId) -> Self {
        self.shard = Some(shard);
        self
    }

    /// True while some shard (normally this one) holds ownership.
    pub fn is_owned(&self) -> bool {
        self.shard.is_some()
    }
}

/// Links a job to one execution slot. Its `complete` bit is the canonical
/// "is this job done" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueueEntry {
    pub id: HqeId,
    pub job_id: JobId,
    pub host_id: Option<HostId>,
    pub status: String,
    pub active: bool,
    pub complete: bool,
    pub aborted: bool,
}

impl HostQueueEntry {
    pub fn queued(id: HqeId, job_id: JobId, host_id: Option<HostId>) -> Self {
        Self {
            id,
            job_id,
            host_id,
            status: "Queued".to_string(),
            active: false,
            complete: false,
            aborted: false,
        }
    }

    /// Mark the entry finished the way the local scheduler does.
    pub fn finish(&mut self) {
        self.status = "Completed".to_string();
        self.active = false;
        self.complete = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub invalid: bool,
    pub leased: bool,
    pub locked: bool,
    pub status: String,
    #[serde(default)]
    pub labels: Vec<LabelId>,
    pub shard: Option<ShardId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    #[serde(default)]
    pub platform: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login: String,
}

/// This or another shard, identified by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub hostname: String,
    #[serde(default)]
    pub labels: Vec<LabelId>,
}

/// Completion state of a job, derived from its queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The job has no queue entries yet.
    Unscheduled,
    /// At least one entry is still running or queued.
    Incomplete,
    /// Every entry is complete.
    Complete,
}

impl Completion {
    pub fn of<'a>(entries: impl IntoIterator<Item = &'a HostQueueEntry>) -> Self {
        let mut seen = false;
        for hqe in entries {
            if !hqe.complete {
                return Completion::Incomplete;
            }
            seen = true;
        }
        if seen {
            Completion::Complete
        } else {
            Completion::Unscheduled
        }
    }
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Unscheduled => write!(f, "unscheduled"),
            Completion::Incomplete => write!(f, "incomplete"),
            Completion::Complete => write!(f, "complete"),
        }
    }
}
