//! In-process cluster harness: master and worker nodes on loopback with
//! tight timings, so whole-cluster scenarios run in seconds.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use dvt_core::client;
use dvt_core::config::{NodeConfig, NodeRole};
use dvt_core::media::MediaExecutor;
use dvt_core::node::{self, NodeState};

pub const POLL: Duration = Duration::from_millis(100);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

pub fn test_config(role: NodeRole, data_dir: &TempDir) -> NodeConfig {
    NodeConfig {
        role,
        listen_addr: "127.0.0.1:0".to_string(),
        master_addr: None,
        peers: Vec::new(),
        backups: Vec::new(),
        data_dir: Some(data_dir.path().to_path_buf()),
        segment_seconds: 1,
        shard_timeout_secs: 5,
        max_attempts: 3,
        starvation_threshold_secs: 2,
        job_concurrency: 4,
        worker_capacity: 2,
        score_cadence_secs: 1,
        score_ttl_secs: 5,
        suspect_timeout_secs: 3,
        dead_timeout_secs: 6,
        master_silence_secs: 3,
        election_timeout_ms: (100, 300),
        stream_idle_timeout_secs: 5,
        local_store_durable: false,
        ffmpeg_path: "ffmpeg-not-used".to_string(),
        score_weights: Default::default(),
        score_override: None,
    }
}

/// Reserve a loopback address for a node whose peers must know it before
/// it starts (election topologies).
pub fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    listener.local_addr().expect("local addr").to_string()
}

pub struct TestNode {
    pub state: Arc<NodeState>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn addr(&self) -> &str {
        &self.state.self_addr
    }

    pub fn kill(&self) {
        self.state.shutdown();
    }
}

/// Start a node from a fully prepared config.
pub async fn start_node_cfg(cfg: NodeConfig, media: Arc<dyn MediaExecutor>, dir: TempDir) -> TestNode {
    let state = node::start_node_with_media(cfg, media)
        .await
        .expect("start node");
    TestNode { state, dir }
}

pub async fn start_master(media: Arc<dyn MediaExecutor>, backups: Vec<String>) -> TestNode {
    let dir = TempDir::new().expect("master tempdir");
    let mut cfg = test_config(NodeRole::Master, &dir);
    cfg.backups = backups;
    let state = node::start_node_with_media(cfg, media)
        .await
        .expect("start master");
    TestNode { state, dir }
}

pub async fn start_worker(
    media: Arc<dyn MediaExecutor>,
    master: &str,
    peers: Vec<String>,
    capacity: usize,
    score_override: Option<f64>,
) -> TestNode {
    let dir = TempDir::new().expect("worker tempdir");
    let mut cfg = test_config(NodeRole::Worker, &dir);
    cfg.master_addr = Some(master.to_string());
    cfg.peers = peers;
    cfg.worker_capacity = capacity;
    cfg.score_override = score_override;
    let state = node::start_node_with_media(cfg, media)
        .await
        .expect("start worker");
    TestNode { state, dir }
}

/// Wait until the master's registry shows `n` workers with fresh scores.
pub async fn await_workers_scored(master: &str, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(stats) = client::node_stats(master, RPC_TIMEOUT).await {
            let scored = stats
                .iter()
                .filter(|s| s.role == "worker" && s.score.is_some())
                .count();
            if scored >= n {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "workers never reported scores to {master}"
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Poll `GetCurrentMaster` on `via` until it names a master other than
/// `old_master`, then return that address.
pub async fn await_new_master(via: &str, old_master: &str, within: Duration) -> String {
    let deadline = Instant::now() + within;
    loop {
        if let Ok((Some(master), _term)) = client::current_master(via, RPC_TIMEOUT).await {
            if master != old_master {
                return master;
            }
        }
        assert!(
            Instant::now() < deadline,
            "no new master elected via {via} within {within:?}"
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Write a deterministic pseudo-video source of `len` bytes.
pub fn source_bytes(len: usize) -> Vec<u8> {
    (0u8..=255).cycle().take(len).collect()
}
