//! Per-node view of peers: who exists, how alive they are, how loaded.
//!
//! Single writer discipline behind one lock; scheduling reads copy-on-read
//! snapshots so dispatch decisions never hold the lock across I/O. Score
//! updates are last-writer-wins keyed by reporter address.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::NodeConfig;
use crate::wire::NodeStat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

impl Liveness {
    pub fn as_str(self) -> &'static str {
        match self {
            Liveness::Alive => "alive",
            Liveness::Suspect => "suspect",
            Liveness::Dead => "dead",
        }
    }
}

/// Neutral score used when a node's last report is older than `score_ttl`.
pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone)]
struct NodeRecord {
    addr: String,
    is_master: bool,
    registered_at: Instant,
    last_seen: Instant,
    last_score: Option<(f64, Instant)>,
    capacity: u32,
    in_flight: u32,
}

/// Scheduling view of one eligible worker.
#[derive(Debug, Clone)]
pub struct WorkerCandidate {
    pub addr: String,
    /// Fresh score, or `NEUTRAL_SCORE` when stale/unknown.
    pub score: f64,
    pub in_flight: u32,
    pub capacity: u32,
}

/// Address-keyed peer registry.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a worker. Duplicate registration refreshes liveness.
    pub fn register(&self, addr: &str, capacity: u32) {
        let mut nodes = self.nodes.write().unwrap();
        let now = Instant::now();
        nodes
            .entry(addr.to_string())
            .and_modify(|n| {
                n.last_seen = now;
                n.capacity = capacity;
            })
            .or_insert_with(|| {
                tracing::info!(worker = addr, capacity, "worker registered");
                NodeRecord {
                    addr: addr.to_string(),
                    is_master: false,
                    registered_at: now,
                    last_seen: now,
                    last_score: None,
                    capacity,
                    in_flight: 0,
                }
            });
    }

    /// Record any sign of life from a peer (score report, ping, vote).
    pub fn touch(&self, addr: &str) {
        let mut nodes = self.nodes.write().unwrap();
        let now = Instant::now();
        nodes
            .entry(addr.to_string())
            .and_modify(|n| n.last_seen = now)
            .or_insert_with(|| NodeRecord {
                addr: addr.to_string(),
                is_master: false,
                registered_at: now,
                last_seen: now,
                last_score: None,
                capacity: 1,
                in_flight: 0,
            });
    }

    /// Last-writer-wins score update.
    pub fn update_score(&self, addr: &str, score: f64) {
        self.touch(addr);
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.last_score = Some((score, Instant::now()));
        }
    }

    pub fn set_master_flag(&self, addr: &str, is_master: bool) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.is_master = is_master;
        }
    }

    pub fn inc_in_flight(&self, addr: &str) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.in_flight += 1;
        }
    }

    pub fn dec_in_flight(&self, addr: &str) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.in_flight = node.in_flight.saturating_sub(1);
        }
    }

    fn liveness_at(record: &NodeRecord, now: Instant, cfg: &NodeConfig) -> Liveness {
        let silence = now.saturating_duration_since(record.last_seen);
        if silence > Duration::from_secs(cfg.dead_timeout_secs) {
            Liveness::Dead
        } else if silence > Duration::from_secs(cfg.suspect_timeout_secs) {
            Liveness::Suspect
        } else {
            Liveness::Alive
        }
    }

    /// Copy-on-read view of alive workers for one scheduling decision.
    pub fn eligible_workers(&self, cfg: &NodeConfig) -> Vec<WorkerCandidate> {
        self.eligible_workers_at(Instant::now(), cfg)
    }

    fn eligible_workers_at(&self, now: Instant, cfg: &NodeConfig) -> Vec<WorkerCandidate> {
        let ttl = Duration::from_secs(cfg.score_ttl_secs);
        let nodes = self.nodes.read().unwrap();
        nodes
            .values()
            .filter(|n| !n.is_master)
            .filter(|n| Self::liveness_at(n, now, cfg) == Liveness::Alive)
            .map(|n| WorkerCandidate {
                addr: n.addr.clone(),
                score: match n.last_score {
                    Some((score, at)) if now.saturating_duration_since(at) <= ttl => score,
                    _ => NEUTRAL_SCORE,
                },
                in_flight: n.in_flight,
                capacity: n.capacity,
            })
            .collect()
    }

    /// Drop records silent for several dead windows. Returns evicted addrs.
    pub fn evict_silent(&self, cfg: &NodeConfig) -> Vec<String> {
        let cutoff = Duration::from_secs(cfg.dead_timeout_secs * 4);
        let now = Instant::now();
        let mut nodes = self.nodes.write().unwrap();
        let evicted: Vec<String> = nodes
            .values()
            .filter(|n| now.saturating_duration_since(n.last_seen) > cutoff)
            .map(|n| n.addr.clone())
            .collect();
        for addr in &evicted {
            nodes.remove(addr);
            tracing::info!(worker = addr, "evicted silent node record");
        }
        evicted
    }

    /// Number of known peers (election quorum basis), excluding self.
    pub fn known_peers(&self) -> Vec<String> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    /// Full registry view for `GetNodeStats`.
    pub fn stats(&self, cfg: &NodeConfig) -> Vec<NodeStat> {
        let now = Instant::now();
        let ttl = Duration::from_secs(cfg.score_ttl_secs);
        let nodes = self.nodes.read().unwrap();
        let mut stats: Vec<NodeStat> = nodes
            .values()
            .map(|n| NodeStat {
                addr: n.addr.clone(),
                role: if n.is_master { "master" } else { "worker" }.to_string(),
                liveness: Self::liveness_at(n, now, cfg).as_str().to_string(),
                score: match n.last_score {
                    Some((score, at)) if now.saturating_duration_since(at) <= ttl => Some(score),
                    _ => None,
                },
                last_seen_ms_ago: Some(now.saturating_duration_since(n.last_seen).as_millis() as u64),
            })
            .collect();
        stats.sort_by(|a, b| a.addr.cmp(&b.addr));
        stats
    }

    #[cfg(test)]
    fn age_node(&self, addr: &str, by: Duration) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(addr) {
            node.last_seen = Instant::now() - by;
            if let Some((_, at)) = &mut node.last_score {
                *at = Instant::now() - by;
            }
        }
    }
}
