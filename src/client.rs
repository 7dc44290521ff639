use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ShardConfig;
use crate::error::{Result, ShardError};
use crate::heartbeat::{
    ApplyReport, HeartbeatTransport, PacketBuilder, ResponseApplier, ShardIdentity,
};
use crate::model::JobId;
use crate::store::LocalStore;

/// Where the client is within a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Building,
    InFlight,
    Applying,
    Shutdown,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Building => write!(f, "building"),
            SyncState::InFlight => write!(f, "in-flight"),
            SyncState::Applying => write!(f, "applying"),
            SyncState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Summary of one completed heartbeat.
#[derive(Debug)]
pub struct TickReport {
    pub uploaded: Vec<JobId>,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub apply: ApplyReport,
    pub elapsed: Duration,
}

impl TickReport {
    fn log(&self) {
        tracing::info!(
            uploaded = ?self.uploaded,
            hosts_received = self.apply.hosts_received,
            jobs_received = self.apply.jobs_received,
            hosts_applied = self.apply.hosts_applied,
            jobs_applied = self.apply.jobs_applied,
            records_failed = self.apply.failures.len(),
            resynced = ?self.apply.resynced,
            request_bytes = self.request_bytes,
            response_bytes = self.response_bytes,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Heartbeat completed."
        );
    }
}

/// Periodically synchronizes the local store with the master.
///
/// Ticks never overlap. Within a tick the order is fixed: build the packet,
/// call the master, stamp uploaded jobs with this shard's id, apply the
/// response. Shutdown is only observed between ticks.
pub struct ShardClient<S: LocalStore, T: HeartbeatTransport> {
    store: S,
    transport: T,
    identity: ShardIdentity,
    tick_pause: Duration,
    state: SyncState,
    shutdown: CancellationToken,
}

impl<S: LocalStore, T: HeartbeatTransport> ShardClient<S, T> {
    pub fn new(
        store: S,
        transport: T,
        shard_hostname: impl Into<String>,
        tick_pause: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            identity: ShardIdentity::new(shard_hostname),
            tick_pause,
            state: SyncState::Idle,
            shutdown,
        }
    }

    /// Fails with a configuration error when `config` does not describe a
    /// shard.
    pub fn from_config(
        config: &ShardConfig,
        store: S,
        transport: T,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            store,
            transport,
            config.shard_hostname()?,
            config.heartbeat_pause,
            shutdown,
        ))
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Token that stops [`run`](Self::run) at the next tick boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop after the current tick.
    pub fn shutdown(&self) {
        tracing::info!("Shutdown request received.");
        self.shutdown.cancel();
    }

    /// Run ticks until shutdown is requested.
    ///
    /// A transport failure costs one tick and nothing else. Any other error
    /// ends the loop and is returned to the caller.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(shard = %self.identity.hostname(), pause = ?self.tick_pause, "Starting shard client.");

        while !self.shutdown.is_cancelled() {
            match self.tick().await {
                Ok(report) => report.log(),
                Err(ShardError::Transport(e)) => {
                    tracing::warn!(error = %e, "Heartbeat failed, will retry on next tick");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Heartbeat aborted");
                    return Err(e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.tick_pause) => {}
            }
        }

        self.state = SyncState::Shutdown;
        tracing::info!("Shard client stopped.");
        Ok(())
    }

    /// Perform one heartbeat.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let result = self.do_heartbeat().await;
        self.state = SyncState::Idle;
        result
    }

    async fn do_heartbeat(&mut self) -> Result<TickReport> {
        let started = Instant::now();
        tracing::info!("Performing heartbeat.");

        self.state = SyncState::Building;
        let packet = PacketBuilder::new(&self.store).build_packet(self.identity.hostname())?;
        let request_bytes = encoded_len(&packet)?;

        self.state = SyncState::InFlight;
        let response = self.transport.heartbeat(&packet).await?;
        let response_bytes = encoded_len(&response)?;

        // The upload is acknowledged once the call returns. Stamping before
        // applying the response means a crash in between can never cause a
        // second upload of the same jobs.
        let uploaded = packet.uploaded_job_ids();
        self.mark_jobs_as_uploaded(&uploaded)?;

        self.state = SyncState::Applying;
        let apply = ResponseApplier::new(&mut self.store).apply(&response)?;

        Ok(TickReport {
            uploaded,
            request_bytes,
            response_bytes,
            apply,
            elapsed: started.elapsed(),
        })
    }

    /// Stamp `job_ids` with this shard's id so they are not uploaded again.
    /// A no-op while the shard has no record of itself, which only happens
    /// before it ever received a job.
    pub fn mark_jobs_as_uploaded(&mut self, job_ids: &[JobId]) -> Result<usize> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let Some(shard_id) = self.identity.resolve(&self.store)?.map(|s| s.id) else {
            tracing::warn!(jobs = ?job_ids, "No local shard record, leaving uploaded jobs unstamped");
            return Ok(0);
        };
        Ok(self.store.update_job_shard(job_ids, Some(shard_id))?)
    }
}

fn encoded_len<V: serde::Serialize>(value: &V) -> Result<usize> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .map_err(|e| ShardError::Internal(format!("cannot encode heartbeat: {}", e)))
}
