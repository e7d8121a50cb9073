//! Node runtime: shared state, startup wiring, and the election driver.
//!
//! A node always serves election traffic. Role decides the rest: a master
//! runs the master engine; a worker runs the worker engine and may be
//! promoted to master by winning an election, at which point it keeps its
//! backup store and starts orchestrating.

use anyhow::{Context, Result};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{NodeConfig, NodeRole};
use crate::election::{self, Election, Role};
use crate::master::{restore_from_backups, MasterEngine};
use crate::media::{FfmpegExecutor, MediaExecutor};
use crate::registry::NodeRegistry;
use crate::server;
use crate::storage::NodePaths;
use crate::wire::{self, Message};
use crate::worker::{self, WorkerEngine};

pub struct NodeState {
    pub cfg: NodeConfig,
    /// The address peers reach this node at (post-bind, so `:0` works).
    pub self_addr: String,
    pub paths: NodePaths,
    pub registry: Arc<NodeRegistry>,
    pub election: Arc<Election>,
    pub media: Arc<dyn MediaExecutor>,
    master: RwLock<Option<Arc<MasterEngine>>>,
    worker: RwLock<Option<Arc<WorkerEngine>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeState {
    pub fn master_engine(&self) -> Option<Arc<MasterEngine>> {
        self.master.read().unwrap().clone()
    }

    pub fn worker_engine(&self) -> Option<Arc<WorkerEngine>> {
        self.worker.read().unwrap().clone()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop serving: ends the accept loop and every periodic task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Everyone this node would ask for a vote: configured peers plus any
    /// peer the registry has seen, minus itself.
    pub fn peer_addrs(&self) -> Vec<String> {
        let mut peers = self.cfg.peers.clone();
        for addr in self.registry.known_peers() {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        peers.retain(|p| *p != self.self_addr);
        peers.sort();
        peers
    }

    /// Install the master engine after an election win (or at startup for a
    /// configured master). Callers adopt local replicas afterwards.
    fn install_master(self: &Arc<Self>) -> Arc<MasterEngine> {
        let engine = MasterEngine::new(
            self.cfg.clone(),
            self.self_addr.clone(),
            self.paths.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.election),
            Arc::clone(&self.media),
        );
        *self.master.write().unwrap() = Some(Arc::clone(&engine));
        engine
    }

    /// Step down: drop the master engine and fail its in-flight jobs.
    pub fn demote_master(&self) {
        if let Some(engine) = self.master.write().unwrap().take() {
            tracing::info!("stepping down as master");
            engine.demote();
        }
    }
}

/// Bind, wire up engines for the configured role, and spawn the serving
/// loops. Returns once the listener is live; `state.shutdown()` stops it.
pub async fn start_node(cfg: NodeConfig) -> Result<Arc<NodeState>> {
    let media: Arc<dyn MediaExecutor> = Arc::new(FfmpegExecutor::new(cfg.ffmpeg_path.clone()));
    start_node_with_media(cfg, media).await
}

/// As `start_node`, with an injected media executor (tests).
pub async fn start_node_with_media(
    cfg: NodeConfig,
    media: Arc<dyn MediaExecutor>,
) -> Result<Arc<NodeState>> {
    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    let self_addr = listener.local_addr().context("local addr")?.to_string();
    let data_dir = cfg.resolve_data_dir()?;
    let paths = NodePaths::new(data_dir);

    let initial_role = match cfg.role {
        NodeRole::Master => Role::Master,
        NodeRole::Worker => Role::Follower,
    };
    let election = Arc::new(Election::new(initial_role, cfg.master_addr.clone()));
    let (shutdown_tx, _) = watch::channel(false);

    let state = Arc::new(NodeState {
        cfg: cfg.clone(),
        self_addr: self_addr.clone(),
        paths: paths.clone(),
        registry: Arc::new(NodeRegistry::new()),
        election: Arc::clone(&election),
        media: Arc::clone(&media),
        master: RwLock::new(None),
        worker: RwLock::new(None),
        shutdown_tx,
    });

    match cfg.role {
        NodeRole::Master => {
            election.assume_master(&self_addr);
            let engine = state.install_master();
            engine.adopt_local_backups().await;
            tracing::info!(addr = %self_addr, "node up as master");
        }
        NodeRole::Worker => {
            let engine = WorkerEngine::new(
                cfg.clone(),
                self_addr.clone(),
                paths,
                media,
                Arc::clone(&election),
            );
            *state.worker.write().unwrap() = Some(Arc::clone(&engine));
            tokio::spawn(worker::run_report_loop(engine, state.shutdown_rx()));
            tracing::info!(addr = %self_addr, master = ?cfg.master_addr, "node up as worker");
        }
    }

    tokio::spawn(server::run_server(
        Arc::clone(&state),
        listener,
        state.shutdown_rx(),
    ));
    tokio::spawn(run_election_loop(Arc::clone(&state), state.shutdown_rx()));
    tokio::spawn(run_sweep_loop(Arc::clone(&state), state.shutdown_rx()));

    Ok(state)
}

/// Periodic registry housekeeping while acting as master.
async fn run_sweep_loop(node: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(
        node.cfg.dead_timeout_secs.max(1),
    ));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        if let Some(master) = node.master_engine() {
            master.sweep_registry();
        }
    }
}

/// Follower-side election trigger: master silence past the configured
/// window starts a candidacy, with randomized backoff between rounds.
pub async fn run_election_loop(node: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    let silence = std::time::Duration::from_secs(node.cfg.master_silence_secs);
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        if node.election.is_master() {
            continue;
        }
        if node.election.master_silent_for() < silence {
            continue;
        }

        // De-synchronize competing candidates before each round.
        let backoff = election::election_backoff(node.cfg.election_timeout_ms);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        if node.election.master_silent_for() < silence {
            // A master appeared while we waited.
            continue;
        }
        run_candidacy(&node).await;
    }
}

async fn run_candidacy(node: &Arc<NodeState>) {
    let term = node.election.start_candidacy(&node.self_addr);
    let peers = node.peer_addrs();
    let quorum = election::quorum(peers.len() + 1);
    let vote_timeout = std::time::Duration::from_millis(node.cfg.election_timeout_ms.0);

    let mut requests: JoinSet<_> = JoinSet::new();
    for peer in peers.clone() {
        let candidate = node.self_addr.clone();
        requests.spawn(async move {
            wire::request(
                &peer,
                &Message::RequestVote {
                    term,
                    candidate,
                },
                vote_timeout,
            )
            .await
        });
    }

    let mut votes = 1usize; // self-vote
    while let Some(joined) = requests.join_next().await {
        match joined {
            Ok(Ok(Message::VoteReply { term: peer_term, granted })) => {
                if peer_term > term {
                    node.election.observe_term(peer_term);
                    requests.abort_all();
                    return;
                }
                if granted {
                    votes += 1;
                    if votes >= quorum {
                        break;
                    }
                }
            }
            Ok(Ok(other)) => tracing::debug!("unexpected vote reply: {other:?}"),
            Ok(Err(err)) => tracing::debug!("vote request failed: {err}"),
            Err(_) => {}
        }
    }
    requests.abort_all();

    if votes < quorum || !node.election.win(term, &node.self_addr) {
        tracing::debug!(term, votes, quorum, "election round lost");
        node.election.concede(term);
        return;
    }

    tracing::info!(term, votes, quorum, "elected master");
    for peer in &peers {
        let announce = Message::AnnounceMaster {
            term,
            master: node.self_addr.clone(),
        };
        if let Err(err) = wire::send_oneway(peer, &announce, vote_timeout).await {
            tracing::debug!(peer = %peer, "announce failed: {err}");
        }
    }

    let engine = node.install_master();
    engine.adopt_local_backups().await;
    // Pull any artifacts this node lacks from the configured backup set and
    // the peers that just voted.
    let mut sources = node.cfg.backups.clone();
    for peer in peers {
        if !sources.contains(&peer) {
            sources.push(peer);
        }
    }
    restore_from_backups(&engine, &sources).await;
}
