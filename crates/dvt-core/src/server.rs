//! TCP accept loop and per-connection dispatch.
//!
//! One operation per connection. Election traffic is served by every node;
//! master and worker operations are gated on the engines the node currently
//! runs, so a stale client talking to a demoted master gets a redirect
//! instead of silence.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::election::AnnounceOutcome;
use crate::node::NodeState;
use crate::wire::{Connection, Message, WireResult};

pub async fn run_server(
    node: Arc<NodeState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&node);
                        handlers.spawn(async move {
                            let mut conn =
                                Connection::new(stream, node.cfg.stream_idle_timeout());
                            match conn.recv_opt().await {
                                Ok(Some(msg)) => {
                                    if let Err(err) = dispatch(&node, &mut conn, msg).await {
                                        tracing::debug!(%peer, "connection ended: {err}");
                                    }
                                }
                                Ok(None) => {}
                                Err(err) => tracing::debug!(%peer, "bad request: {err}"),
                            }
                        });
                    }
                    Err(err) => tracing::warn!("accept failed: {err}"),
                }
                // Reap finished handlers so the set stays small.
                while handlers.try_join_next().is_some() {}
            }
        }
    }
    handlers.abort_all();
    tracing::info!("server stopped");
}

async fn dispatch(node: &Arc<NodeState>, conn: &mut Connection, msg: Message) -> WireResult<()> {
    match msg {
        // -------- election / cluster, served by every node --------
        Message::RequestVote { term, candidate } => {
            node.registry.touch(&candidate);
            let was_master = node.election.is_master();
            let (granted, current_term) = node.election.handle_request_vote(term, &candidate);
            if was_master && !node.election.is_master() {
                node.demote_master();
            }
            conn.send(&Message::VoteReply {
                term: current_term,
                granted,
            })
            .await
        }
        Message::AnnounceMaster { term, master } => {
            match node
                .election
                .handle_announce(term, &master, &node.self_addr)
            {
                AnnounceOutcome::Demoted => node.demote_master(),
                AnnounceOutcome::Adopted | AnnounceOutcome::Ignored => {}
            }
            if master != node.self_addr {
                node.registry.touch(&master);
                node.registry.set_master_flag(&master, true);
            }
            Ok(())
        }
        Message::GetCurrentMaster => {
            conn.send(&Message::MasterReply {
                master: node.election.known_master(),
                term: node.election.term(),
            })
            .await
        }
        Message::GetNodeStats => {
            conn.send(&Message::NodeStatsReply {
                nodes: node.registry.stats(&node.cfg),
            })
            .await
        }
        // -------- master operations --------
        Message::UploadBegin {
            filename,
            width,
            height,
            format,
        } => match node.master_engine() {
            Some(m) => m.handle_upload(conn, filename, width, height, format).await,
            None => {
                conn.send(&Message::UploadReply {
                    accepted: false,
                    job_id: None,
                    message: not_master(node),
                })
                .await
            }
        },
        Message::Status { job_id } => {
            let reply = match node.master_engine() {
                Some(m) => m.handle_status(&job_id),
                None => Message::StatusReply {
                    status: "not_found".to_string(),
                    message: not_master(node),
                },
            };
            conn.send(&reply).await
        }
        Message::Retrieve { job_id } => match node.master_engine() {
            Some(m) => m.handle_retrieve(conn, job_id).await,
            None => {
                conn.send(&Message::RetrieveReply {
                    ok: false,
                    message: not_master(node),
                })
                .await
            }
        },
        Message::Register { addr, capacity } => {
            let reply = match node.master_engine() {
                Some(m) => m.handle_register(&addr, capacity),
                None => Message::RegisterReply {
                    ok: false,
                    master: node.election.known_master(),
                },
            };
            conn.send(&reply).await
        }
        Message::ReportScore { addr, score } => {
            let reply = match node.master_engine() {
                Some(m) => m.handle_report_score(&addr, score),
                None => Message::Ack {
                    ok: false,
                    message: not_master(node),
                },
            };
            conn.send(&reply).await
        }
        Message::ReportShardStatus {
            worker,
            job_id,
            shard,
            attempt,
            status,
            message,
        } => {
            let reply = match node.master_engine() {
                Some(m) => {
                    m.handle_report_shard_status(&worker, &job_id, shard, attempt, &status, &message)
                }
                None => Message::Ack {
                    ok: false,
                    message: not_master(node),
                },
            };
            conn.send(&reply).await
        }

        // -------- worker operations --------
        Message::ProcessShard {
            job_id,
            shard,
            attempt,
            width,
            height,
            format,
        } => match node.worker_engine() {
            Some(w) => {
                crate::worker::handle_process_shard(
                    &w, conn, job_id, shard, attempt, width, height, format,
                )
                .await
            }
            None => {
                conn.send(&Message::ShardReply {
                    ok: false,
                    message: "node does not transcode".to_string(),
                    output_len: 0,
                })
                .await
            }
        },
        Message::RequestShard {
            job_id,
            shard,
            attempt,
        } => match node.worker_engine() {
            Some(w) => crate::worker::handle_request_shard(&w, conn, job_id, shard, attempt).await,
            None => refuse_stream(conn, "node does not transcode").await,
        },
        Message::ReceiveBackup {
            job_id,
            format,
            checksum,
        } => match node.worker_engine() {
            Some(w) => {
                crate::worker::handle_receive_backup(&w, conn, job_id, format, checksum).await
            }
            None => {
                conn.send(&Message::Ack {
                    ok: false,
                    message: "node has no backup store".to_string(),
                })
                .await
            }
        },
        Message::SendBackup { job_id } => match node.worker_engine() {
            Some(w) => crate::worker::handle_send_backup(&w, conn, job_id).await,
            None => refuse_stream(conn, "node has no backup store").await,
        },
        Message::ListBackups => match node.worker_engine() {
            Some(w) => crate::worker::handle_list_backups(&w, conn).await,
            None => conn.send(&Message::BackupList { jobs: Vec::new() }).await,
        },

        other => {
            tracing::debug!("unexpected opening message: {other:?}");
            Ok(())
        }
    }
}

fn not_master(node: &NodeState) -> String {
    match node.election.known_master() {
        Some(master) => format!("not master; current master is {master}"),
        None => "not master; no master known".to_string(),
    }
}

async fn refuse_stream(conn: &mut Connection, message: &str) -> WireResult<()> {
    conn.send(&Message::RetrieveReply {
        ok: false,
        message: message.to_string(),
    })
    .await
}
