//! Worker engine: transcodes shards on request, stores results, serves as
//! backup store, and keeps the master fed with score reports.

mod process;
mod report;

pub use process::{
    handle_list_backups, handle_process_shard, handle_receive_backup, handle_request_shard,
    handle_send_backup,
};
pub use report::run_report_loop;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;

use crate::config::NodeConfig;
use crate::election::Election;
use crate::job::JobId;
use crate::media::MediaExecutor;
use crate::storage::NodePaths;

/// Key for a stored transcode output: (job, shard, attempt). Repeating an
/// attempt replaces exactly its own output.
pub type OutputKey = (JobId, u32, u32);

pub struct WorkerEngine {
    pub(crate) cfg: NodeConfig,
    pub(crate) self_addr: String,
    pub(crate) paths: NodePaths,
    pub(crate) media: Arc<dyn MediaExecutor>,
    pub(crate) election: Arc<Election>,
    /// Cross-job parallelism bound.
    pub(crate) capacity: Arc<Semaphore>,
    /// Shards of one job run sequentially.
    job_locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    /// Stored transcode outputs, served to `RequestShard`.
    outputs: RwLock<HashMap<OutputKey, PathBuf>>,
}

impl WorkerEngine {
    pub fn new(
        cfg: NodeConfig,
        self_addr: String,
        paths: NodePaths,
        media: Arc<dyn MediaExecutor>,
        election: Arc<Election>,
    ) -> Arc<Self> {
        let capacity = Arc::new(Semaphore::new(cfg.worker_capacity.max(1)));
        Arc::new(Self {
            cfg,
            self_addr,
            paths,
            media,
            election,
            capacity,
            job_locks: Mutex::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn job_lock(&self, job: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.job_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(job.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    pub(crate) fn store_output(&self, key: OutputKey, path: PathBuf) {
        self.outputs.write().unwrap().insert(key, path);
    }

    pub(crate) fn output_for(&self, key: &OutputKey) -> Option<PathBuf> {
        self.outputs.read().unwrap().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::Role;
    use crate::media::FfmpegExecutor;

    fn engine() -> Arc<WorkerEngine> {
        let cfg = NodeConfig::default();
        WorkerEngine::new(
            cfg,
            "127.0.0.1:1".to_string(),
            NodePaths::new("/tmp/dvt-test"),
            Arc::new(FfmpegExecutor::new("ffmpeg")),
            Arc::new(Election::new(Role::Follower, None)),
        )
    }

    #[test]
    fn job_lock_is_shared_per_job() {
        let w = engine();
        let a = w.job_lock("job");
        let b = w.job_lock("job");
        assert!(Arc::ptr_eq(&a, &b));
        let c = w.job_lock("other");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn outputs_keyed_by_attempt() {
        let w = engine();
        let k1 = ("job".to_string(), 0, 1);
        let k2 = ("job".to_string(), 0, 2);
        w.store_output(k1.clone(), PathBuf::from("/a"));
        w.store_output(k2.clone(), PathBuf::from("/b"));
        assert_eq!(w.output_for(&k1), Some(PathBuf::from("/a")));
        assert_eq!(w.output_for(&k2), Some(PathBuf::from("/b")));

        // Replaying an attempt replaces its own slot only.
        w.store_output(k1.clone(), PathBuf::from("/a2"));
        assert_eq!(w.output_for(&k1), Some(PathBuf::from("/a2")));
        assert_eq!(w.output_for(&k2), Some(PathBuf::from("/b")));
    }
}
