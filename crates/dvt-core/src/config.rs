//! Node configuration loaded from `~/.config/dvt/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Role a node starts in. A worker may later be elected master; a node
/// started as master never transcodes shards itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
}

/// Weights for the resource score. Only the ordering of scores matters, but
/// the weights must sum to 1 so scores from different nodes are comparable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub load: f64,
    pub iowait: f64,
    pub net: f64,
    pub mem: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            load: 0.4,
            iowait: 0.2,
            net: 0.2,
            mem: 0.2,
        }
    }
}

impl ScoreWeights {
    /// True when the weights sum to 1 within rounding error.
    pub fn is_normalized(&self) -> bool {
        (self.load + self.iowait + self.net + self.mem - 1.0).abs() < 1e-6
    }
}

/// Global node configuration. Every field has a default so a fresh install
/// works with just a role and a listen address from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Role this node starts in.
    pub role: NodeRole,
    /// Address this node listens on (host:port).
    pub listen_addr: String,
    /// Address of the current master (workers; ignored by a master node).
    pub master_addr: Option<String>,
    /// Known peer addresses for elections (excluding this node).
    pub peers: Vec<String>,
    /// Backup node addresses the master replicates final artifacts to.
    pub backups: Vec<String>,
    /// Root directory for shards and artifacts. Defaults to the XDG data dir.
    pub data_dir: Option<PathBuf>,
    /// Target shard length in seconds.
    pub segment_seconds: u32,
    /// Deadline for one shard assignment, in seconds. The effective deadline
    /// is `max(3 * segment_seconds, shard_timeout_secs)`.
    pub shard_timeout_secs: u64,
    /// Maximum attempts per shard before the job fails.
    pub max_attempts: u32,
    /// Pending shards older than this are hoisted above score order.
    pub starvation_threshold_secs: u64,
    /// How many jobs may run their pipeline concurrently.
    pub job_concurrency: usize,
    /// How many shards a worker processes concurrently (across jobs).
    pub worker_capacity: usize,
    /// Cadence of worker score reports and master pings, in seconds.
    pub score_cadence_secs: u64,
    /// Scores older than this are treated as unknown (neutral).
    pub score_ttl_secs: u64,
    /// No report for this long marks a worker suspect.
    pub suspect_timeout_secs: u64,
    /// No report for this long marks a worker dead.
    pub dead_timeout_secs: u64,
    /// Master silence before a worker starts an election.
    pub master_silence_secs: u64,
    /// Election timeout window in milliseconds (randomized per round).
    pub election_timeout_ms: (u64, u64),
    /// Idle timeout on upload/retrieval chunk arrival, in seconds.
    pub stream_idle_timeout_secs: u64,
    /// Treat the local store as durable even with no backup ack.
    pub local_store_durable: bool,
    /// Path of the media tool binary.
    pub ffmpeg_path: String,
    /// Resource score weights.
    pub score_weights: ScoreWeights,
    /// Report this fixed score instead of sampling (benchmarks, tests).
    pub score_override: Option<f64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Worker,
            listen_addr: "127.0.0.1:50051".to_string(),
            master_addr: None,
            peers: Vec::new(),
            backups: Vec::new(),
            data_dir: None,
            segment_seconds: 10,
            shard_timeout_secs: 120,
            max_attempts: 3,
            starvation_threshold_secs: 30,
            job_concurrency: 4,
            worker_capacity: 2,
            score_cadence_secs: 2,
            score_ttl_secs: 10,
            suspect_timeout_secs: 6,
            dead_timeout_secs: 15,
            master_silence_secs: 10,
            election_timeout_ms: (1000, 2000),
            stream_idle_timeout_secs: 30,
            local_store_durable: false,
            ffmpeg_path: "ffmpeg".to_string(),
            score_weights: ScoreWeights::default(),
            score_override: None,
        }
    }
}

impl NodeConfig {
    /// Effective deadline for one shard assignment.
    pub fn shard_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.segment_seconds * 3).max(self.shard_timeout_secs))
    }

    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_secs(self.starvation_threshold_secs)
    }

    pub fn score_cadence(&self) -> Duration {
        Duration::from_secs(self.score_cadence_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// Root for this node's shard and artifact directories.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("dvt")?;
        Ok(xdg_dirs.get_data_home())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dvt")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load the node configuration, writing a default file on first run so
/// operators have something concrete to edit.
pub fn load_or_init() -> Result<NodeConfig> {
    let path = config_path()?;
    match fs::read_to_string(&path) {
        Ok(raw) => toml::from_str(&raw).with_context(|| format!("parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let cfg = NodeConfig::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, toml::to_string_pretty(&cfg)?)?;
            tracing::info!(path = %path.display(), "wrote default config");
            Ok(cfg)
        }
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}
