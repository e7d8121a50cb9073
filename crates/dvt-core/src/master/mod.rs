//! Master engine: job lifecycle, scheduling, collection, replication.

mod pipeline;
mod replicate;
mod schedule;

pub use replicate::restore_from_backups;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::election::Election;
use crate::job::{FailReason, JobBoard, JobId, JobStatus, ShardStatus};
use crate::media::{MediaExecutor, VideoFormat};
use crate::registry::NodeRegistry;
use crate::retry::AttemptPolicy;
use crate::sanitize::job_id_from_filename;
use crate::storage::{NodePaths, TempWriter};
use crate::wire::{Connection, Message, WireResult};

/// Upper bounds on requested dimensions (8K UHD).
const MAX_WIDTH: u32 = 7680;
const MAX_HEIGHT: u32 = 4320;

/// The orchestrator. One instance per master incumbency; a demotion drops
/// it, aborting every pipeline task it owns.
pub struct MasterEngine {
    pub(crate) cfg: NodeConfig,
    pub(crate) self_addr: String,
    pub(crate) paths: NodePaths,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) election: Arc<Election>,
    pub(crate) media: Arc<dyn MediaExecutor>,
    pub(crate) board: Arc<JobBoard>,
    pub(crate) policy: AttemptPolicy,
    jobs_sem: Arc<Semaphore>,
    tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl MasterEngine {
    pub fn new(
        cfg: NodeConfig,
        self_addr: String,
        paths: NodePaths,
        registry: Arc<NodeRegistry>,
        election: Arc<Election>,
        media: Arc<dyn MediaExecutor>,
    ) -> Arc<Self> {
        let policy = AttemptPolicy {
            max_attempts: cfg.max_attempts,
            ..AttemptPolicy::default()
        };
        let jobs_sem = Arc::new(Semaphore::new(cfg.job_concurrency.max(1)));
        Arc::new(Self {
            cfg,
            self_addr,
            paths,
            registry,
            election,
            media,
            board: Arc::new(JobBoard::new()),
            policy,
            jobs_sem,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Adopt replicas already present in this node's backup store (a backup
    /// that just won an election serves them directly).
    pub async fn adopt_local_backups(&self) {
        for (job_id, path, format) in self.paths.list_backups() {
            if self.board.snapshot(&job_id).is_none() {
                let checksum = crate::digest::digest_file(&path).await.ok();
                tracing::info!(job = %job_id, "adopted local replica");
                self.board.insert_completed(&job_id, format, path, checksum);
            }
        }
    }

    fn validate_params(width: u32, height: u32, format: &str) -> Result<VideoFormat, String> {
        if width == 0 || width > MAX_WIDTH || height == 0 || height > MAX_HEIGHT {
            return Err(format!("resolution {width}x{height} out of range"));
        }
        VideoFormat::from_str(format).ok_or_else(|| format!("unsupported format {format}"))
    }

    /// `Upload`: validate, reply, receive the stream, publish the source,
    /// and kick off the pipeline. Invalid parameters never create a record.
    pub async fn handle_upload(
        self: &Arc<Self>,
        conn: &mut Connection,
        filename: String,
        width: u32,
        height: u32,
        format: String,
    ) -> WireResult<()> {
        let format = match Self::validate_params(width, height, &format) {
            Ok(f) => f,
            Err(message) => {
                return conn
                    .send(&Message::UploadReply {
                        accepted: false,
                        job_id: None,
                        message,
                    })
                    .await;
            }
        };
        let Some(job_id) = job_id_from_filename(&filename) else {
            return conn
                .send(&Message::UploadReply {
                    accepted: false,
                    job_id: None,
                    message: format!("unusable filename {filename:?}"),
                })
                .await;
        };

        // A finished job with this id is being replaced: clear its artifacts
        // before the new record lands.
        let replacing = self
            .board
            .snapshot(&job_id)
            .map(|s| s.status.is_terminal())
            .unwrap_or(false);
        if replacing {
            if let Err(err) = self.paths.remove_job(&job_id).await {
                tracing::warn!(job = %job_id, "stale artifact cleanup failed: {err:#}");
            }
        }

        let source_path = self.paths.source(&job_id);
        if let Err(err) = self
            .board
            .create(&job_id, source_path.clone(), width, height, format)
        {
            return conn
                .send(&Message::UploadReply {
                    accepted: false,
                    job_id: None,
                    message: err.to_string(),
                })
                .await;
        }
        conn.send(&Message::UploadReply {
            accepted: true,
            job_id: Some(job_id.clone()),
            message: String::new(),
        })
        .await?;

        let mut writer = match TempWriter::create(&source_path).await {
            Ok(w) => w,
            Err(err) => {
                self.board.set_status(
                    &job_id,
                    JobStatus::Failed(FailReason::StorageError),
                    &format!("{err:#}"),
                );
                return conn
                    .send(&Message::Ack {
                        ok: false,
                        message: format!("storage error: {err:#}"),
                    })
                    .await;
            }
        };
        let received = match conn.recv_stream(writer.file_mut()).await {
            Ok(n) => n,
            Err(err) => {
                let part = writer.abandon();
                tracing::warn!(job = %job_id, part = %part.display(), "upload stream failed: {err}");
                self.board.set_status(
                    &job_id,
                    JobStatus::Failed(FailReason::StorageError),
                    "upload aborted",
                );
                return Err(err);
            }
        };
        if let Err(err) = writer.finalize().await {
            self.board.set_status(
                &job_id,
                JobStatus::Failed(FailReason::StorageError),
                &format!("{err:#}"),
            );
            return conn
                .send(&Message::Ack {
                    ok: false,
                    message: format!("storage error: {err:#}"),
                })
                .await;
        }

        tracing::info!(job = %job_id, bytes = received, width, height, format = format.as_str(), "upload complete");
        self.spawn_job(job_id.clone());
        conn.send(&Message::Ack {
            ok: true,
            message: job_id,
        })
        .await
    }

    /// `Retrieve`: stream the final artifact of a completed job.
    pub async fn handle_retrieve(&self, conn: &mut Connection, job_id: String) -> WireResult<()> {
        let reply = match self.board.snapshot(&job_id) {
            None => Message::RetrieveReply {
                ok: false,
                message: format!("job {job_id} not found"),
            },
            Some(snap) if snap.status != JobStatus::Completed => Message::RetrieveReply {
                ok: false,
                message: format!("job {job_id} not ready: {}", snap.status.render()),
            },
            Some(snap) => match snap.final_path {
                Some(path) if path.exists() => {
                    conn.send(&Message::RetrieveReply {
                        ok: true,
                        message: String::new(),
                    })
                    .await?;
                    conn.send_file(&path).await?;
                    return Ok(());
                }
                _ => Message::RetrieveReply {
                    ok: false,
                    message: format!("artifact for {job_id} missing from store"),
                },
            },
        };
        conn.send(&reply).await
    }

    /// `GetStatus`: non-blocking snapshot.
    pub fn handle_status(&self, job_id: &str) -> Message {
        match self.board.snapshot(job_id) {
            Some(snap) => Message::StatusReply {
                status: snap.status.render(),
                message: snap.message,
            },
            None => Message::StatusReply {
                status: "not_found".to_string(),
                message: format!("no job named {job_id}"),
            },
        }
    }

    /// `RegisterWorker`: admit (or refresh) a worker with a neutral score.
    pub fn handle_register(&self, addr: &str, capacity: u32) -> Message {
        self.registry.register(addr, capacity);
        Message::RegisterReply {
            ok: true,
            master: Some(self.self_addr.clone()),
        }
    }

    pub fn handle_report_score(&self, addr: &str, score: f64) -> Message {
        self.registry.update_score(addr, score);
        Message::Ack {
            ok: true,
            message: String::new(),
        }
    }

    /// `ReportShardStatus`: idempotent board update; stale attempts ignored.
    pub fn handle_report_shard_status(
        &self,
        worker: &str,
        job_id: &str,
        shard: u32,
        attempt: u32,
        status: &str,
        message: &str,
    ) -> Message {
        self.registry.touch(worker);
        if let Some(status) = ShardStatus::from_str(status) {
            self.board
                .report_shard_status(job_id, shard, attempt, status, message);
        }
        Message::Ack {
            ok: true,
            message: String::new(),
        }
    }

    fn spawn_job(self: &Arc<Self>, job_id: JobId) {
        let engine = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            let permit = match engine.jobs_sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            pipeline::run_pipeline(&engine, &id).await;
            drop(permit);
            engine.tasks.lock().unwrap().remove(&id);
        });
        self.tasks.lock().unwrap().insert(job_id, handle);
    }

    /// Step down: abort every pipeline and mark mid-flight jobs failed so
    /// clients resubmit to the new master.
    pub fn demote(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (job_id, handle) in tasks.drain() {
            tracing::info!(job = %job_id, "aborting pipeline on demotion");
            handle.abort();
        }
        drop(tasks);
        self.board.fail_all_active(FailReason::MasterFailover);
    }

    /// Registry housekeeping, run on a timer while master.
    pub fn sweep_registry(&self) {
        self.registry.evict_silent(&self.cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_validation_bounds() {
        assert!(MasterEngine::validate_params(640, 480, "mp4").is_ok());
        assert!(MasterEngine::validate_params(7680, 4320, "mkv").is_ok());
        assert!(MasterEngine::validate_params(0, 480, "mp4").is_err());
        assert!(MasterEngine::validate_params(640, 0, "mp4").is_err());
        assert!(MasterEngine::validate_params(7681, 480, "mp4").is_err());
        assert!(MasterEngine::validate_params(640, 4321, "mp4").is_err());
        assert!(MasterEngine::validate_params(640, 480, "avi").is_err());
    }
}
