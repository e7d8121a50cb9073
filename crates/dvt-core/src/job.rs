//! Job and shard state, owned by the master engine.
//!
//! The board is the single writer for all job mutations; RPC handlers and
//! pipeline tasks go through it, readers get snapshots. Statuses are sum
//! types in memory and strings on the wire.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::media::VideoFormat;

/// Job identifier, derived from the uploaded filename.
pub type JobId = String;

/// Job-scoped shard index (0..N-1, segmentation order).
pub type ShardIndex = u32;

/// Reason a job failed, rendered as `failed:<reason>` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    ShardExhausted,
    MediaError,
    StorageError,
    MasterFailover,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::ShardExhausted => "shard-exhausted",
            FailReason::MediaError => "media-error",
            FailReason::StorageError => "storage-error",
            FailReason::MasterFailover => "master-failover",
        }
    }
}

/// Lifecycle of a job. Monotonic within one master incumbency; a failover
/// may regress a mid-flight job to `Failed(MasterFailover)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Uploading,
    Segmenting,
    Dispatching,
    Processing,
    Collecting,
    Concatenating,
    Completed,
    Failed(FailReason),
}

impl JobStatus {
    /// Wire spelling, e.g. `processing` or `failed:shard-exhausted`.
    pub fn render(self) -> String {
        match self {
            JobStatus::Uploading => "uploading".to_string(),
            JobStatus::Segmenting => "segmenting".to_string(),
            JobStatus::Dispatching => "dispatching".to_string(),
            JobStatus::Processing => "processing".to_string(),
            JobStatus::Collecting => "collecting".to_string(),
            JobStatus::Concatenating => "concatenating".to_string(),
            JobStatus::Completed => "completed".to_string(),
            JobStatus::Failed(reason) => format!("failed:{}", reason.as_str()),
        }
    }

    /// Position in the pipeline, used to reject regressions.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Uploading => 0,
            JobStatus::Segmenting => 1,
            JobStatus::Dispatching => 2,
            JobStatus::Processing => 3,
            JobStatus::Collecting => 4,
            JobStatus::Concatenating => 5,
            JobStatus::Completed => 6,
            JobStatus::Failed(_) => 7,
        }
    }

    /// Completed and failed jobs accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_))
    }
}

/// Lifecycle of one shard attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Pending,
    Assigned,
    Processing,
    Ready,
    Failed,
}

impl ShardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShardStatus::Pending => "pending",
            ShardStatus::Assigned => "assigned",
            ShardStatus::Processing => "processing",
            ShardStatus::Ready => "ready",
            ShardStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ShardStatus::Pending),
            "assigned" => Some(ShardStatus::Assigned),
            "processing" => Some(ShardStatus::Processing),
            "ready" => Some(ShardStatus::Ready),
            "failed" => Some(ShardStatus::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            ShardStatus::Pending => 0,
            ShardStatus::Assigned => 1,
            ShardStatus::Processing => 2,
            ShardStatus::Ready => 3,
            ShardStatus::Failed => 4,
        }
    }
}

/// One contiguous segment of a job's input.
#[derive(Debug, Clone)]
pub struct Shard {
    pub index: ShardIndex,
    /// Source segment on the master.
    pub src_path: PathBuf,
    pub status: ShardStatus,
    /// 1-based attempt counter; bumped on retry.
    pub attempt: u32,
    pub assigned_worker: Option<String>,
    /// Workers that already failed this shard; avoided on reassignment.
    pub failed_workers: Vec<String>,
    /// Collected output on the master, set once fetched.
    pub processed_path: Option<PathBuf>,
    /// When the current attempt entered `Pending` (starvation tracking).
    pub pending_since: Instant,
    /// When the current attempt was handed to a worker (deadline tracking).
    pub assigned_at: Option<Instant>,
    pub message: String,
}

impl Shard {
    pub fn new(index: ShardIndex, src_path: PathBuf) -> Self {
        Self {
            index,
            src_path,
            status: ShardStatus::Pending,
            attempt: 1,
            assigned_worker: None,
            failed_workers: Vec::new(),
            processed_path: None,
            pending_since: Instant::now(),
            assigned_at: None,
            message: String::new(),
        }
    }
}

/// One client-submitted transcoding request.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: VideoFormat,
    pub shards: Vec<Shard>,
    pub status: JobStatus,
    pub message: String,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    /// Replicated to >=1 backup, or the local store counts as durable.
    pub durable: bool,
    /// SHA-256 of the final artifact, set at completion.
    pub checksum: Option<String>,
    /// Final artifact path, set at completion.
    pub final_path: Option<PathBuf>,
}

/// Client-facing snapshot: `{status, message}` plus what retrieval needs.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub format: VideoFormat,
    pub final_path: Option<PathBuf>,
    pub durable: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error from board mutations that RPC handlers surface to callers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} is already active")]
    AlreadyActive(JobId),
}

/// Owner of all job state on the master. Single writer discipline: all
/// mutation goes through `&self` methods guarding one lock; readers get
/// cloned snapshots.
#[derive(Default)]
pub struct JobBoard {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job record at upload start. A job id may be reused only
    /// once the previous job with that id is terminal; the prior artifact
    /// is then replaced.
    pub fn create(
        &self,
        id: &str,
        source_path: PathBuf,
        width: u32,
        height: u32,
        format: VideoFormat,
    ) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(existing) = jobs.get(id) {
            if !existing.status.is_terminal() {
                return Err(JobError::AlreadyActive(id.to_string()));
            }
        }
        jobs.insert(
            id.to_string(),
            Job {
                id: id.to_string(),
                source_path,
                width,
                height,
                format,
                shards: Vec::new(),
                status: JobStatus::Uploading,
                message: String::new(),
                created_at_ms: now_ms(),
                completed_at_ms: None,
                durable: false,
                checksum: None,
                final_path: None,
            },
        );
        Ok(())
    }

    /// Register a restored artifact (failover path) directly as completed.
    pub fn insert_completed(
        &self,
        id: &str,
        format: VideoFormat,
        final_path: PathBuf,
        checksum: Option<String>,
    ) {
        let mut jobs = self.jobs.write().unwrap();
        jobs.insert(
            id.to_string(),
            Job {
                id: id.to_string(),
                source_path: PathBuf::new(),
                width: 0,
                height: 0,
                format,
                shards: Vec::new(),
                status: JobStatus::Completed,
                message: "restored from backup".to_string(),
                created_at_ms: now_ms(),
                completed_at_ms: Some(now_ms()),
                durable: true,
                checksum,
                final_path: Some(final_path),
            },
        );
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(id).map(|job| JobSnapshot {
            id: job.id.clone(),
            status: job.status,
            message: job.message.clone(),
            format: job.format,
            final_path: job.final_path.clone(),
            durable: job.durable,
        })
    }

    /// Clone of the full job record (pipeline task use).
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Advance job status. Regressions are ignored (reports can race the
    /// pipeline); terminal states are sticky.
    pub fn set_status(&self, id: &str, status: JobStatus, message: &str) {
        let mut jobs = self.jobs.write().unwrap();
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        if job.status.is_terminal() || status.rank() < job.status.rank() {
            tracing::debug!(
                job = id,
                from = %job.status.render(),
                to = %status.render(),
                "ignoring status regression"
            );
            return;
        }
        job.status = status;
        job.message = message.to_string();
        if status.is_terminal() {
            job.completed_at_ms = Some(now_ms());
        }
    }

    /// Mark every non-terminal job failed (new master taking over, or
    /// shutdown). Returns the ids that were failed.
    pub fn fail_all_active(&self, reason: FailReason) -> Vec<JobId> {
        let mut jobs = self.jobs.write().unwrap();
        let mut failed = Vec::new();
        for (id, job) in jobs.iter_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed(reason);
                job.message = format!("failed:{}", reason.as_str());
                job.completed_at_ms = Some(now_ms());
                failed.push(id.clone());
            }
        }
        failed
    }

    pub fn set_shards(&self, id: &str, shards: Vec<Shard>) {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.shards = shards;
        }
    }

    /// Record completion: final artifact path, checksum, timestamps.
    pub fn complete(&self, id: &str, final_path: PathBuf, checksum: String) {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.final_path = Some(final_path);
            job.checksum = Some(checksum);
            job.status = JobStatus::Completed;
            job.message = "completed".to_string();
            job.completed_at_ms = Some(now_ms());
        }
    }

    pub fn mark_durable(&self, id: &str) {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.durable = true;
        }
    }

    /// Record an assignment made by the scheduler.
    pub fn assign_shard(&self, id: &str, index: ShardIndex, worker: &str) {
        let mut jobs = self.jobs.write().unwrap();
        let Some(shard) = jobs
            .get_mut(id)
            .and_then(|j| j.shards.get_mut(index as usize))
        else {
            return;
        };
        shard.status = ShardStatus::Assigned;
        shard.assigned_worker = Some(worker.to_string());
        shard.assigned_at = Some(Instant::now());
    }

    /// Apply a worker status report. Idempotent: reports for a superseded
    /// attempt, or that do not advance the current attempt, are ignored.
    /// Returns true when the report was applied.
    pub fn report_shard_status(
        &self,
        id: &str,
        index: ShardIndex,
        attempt: u32,
        status: ShardStatus,
        message: &str,
    ) -> bool {
        let mut jobs = self.jobs.write().unwrap();
        let Some(shard) = jobs
            .get_mut(id)
            .and_then(|j| j.shards.get_mut(index as usize))
        else {
            return false;
        };
        if attempt != shard.attempt {
            tracing::debug!(
                job = id,
                shard = index,
                attempt,
                current = shard.attempt,
                "ignoring stale shard report"
            );
            return false;
        }
        if status.rank() <= shard.status.rank() {
            return false;
        }
        shard.status = status;
        shard.message = message.to_string();
        true
    }

    /// Record the collected output path and mark the shard ready.
    pub fn shard_collected(&self, id: &str, index: ShardIndex, processed_path: PathBuf) {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(shard) = jobs
            .get_mut(id)
            .and_then(|j| j.shards.get_mut(index as usize))
        {
            shard.processed_path = Some(processed_path);
            shard.status = ShardStatus::Ready;
        }
    }

    /// Reset a shard for another attempt. The failed worker is excluded from
    /// reassignment. Returns the new attempt number, or `None` when the
    /// attempt budget is exhausted.
    pub fn retry_shard(&self, id: &str, index: ShardIndex, max_attempts: u32) -> Option<u32> {
        let mut jobs = self.jobs.write().unwrap();
        let shard = jobs
            .get_mut(id)
            .and_then(|j| j.shards.get_mut(index as usize))?;
        if shard.attempt >= max_attempts {
            return None;
        }
        if let Some(worker) = shard.assigned_worker.take() {
            if !shard.failed_workers.contains(&worker) {
                shard.failed_workers.push(worker);
            }
        }
        shard.attempt += 1;
        shard.status = ShardStatus::Pending;
        shard.pending_since = Instant::now();
        shard.assigned_at = None;
        shard.processed_path = None;
        Some(shard.attempt)
    }
}
