//! Integration: master failure, election among workers, and restore of
//! completed artifacts from the backup store.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use common::cluster::{
    await_new_master, await_workers_scored, free_addr, source_bytes, start_node_cfg, test_config,
    POLL, RPC_TIMEOUT,
};
use common::executor::{expected_final, ByteSplitExecutor, SEGMENT_BYTES};
use dvt_core::client;
use dvt_core::config::NodeRole;
use dvt_core::media::{MediaExecutor, VideoFormat};

#[tokio::test]
async fn master_failover_elects_and_restores() {
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());

    // Fixed topology: every node must know its peers before starting.
    let master_addr = free_addr();
    let w1_addr = free_addr();
    let w2_addr = free_addr();

    let master_dir = TempDir::new().unwrap();
    let mut master_cfg = test_config(NodeRole::Master, &master_dir);
    master_cfg.listen_addr = master_addr.clone();
    master_cfg.backups = vec![w1_addr.clone()];
    let master = start_node_cfg(master_cfg, Arc::clone(&media), master_dir).await;

    let w1_dir = TempDir::new().unwrap();
    let mut w1_cfg = test_config(NodeRole::Worker, &w1_dir);
    w1_cfg.listen_addr = w1_addr.clone();
    w1_cfg.master_addr = Some(master_addr.clone());
    w1_cfg.peers = vec![w2_addr.clone()];
    let w1 = start_node_cfg(w1_cfg, Arc::clone(&media), w1_dir).await;

    let w2_dir = TempDir::new().unwrap();
    let mut w2_cfg = test_config(NodeRole::Worker, &w2_dir);
    w2_cfg.listen_addr = w2_addr.clone();
    w2_cfg.master_addr = Some(master_addr.clone());
    w2_cfg.peers = vec![w1_addr.clone()];
    let w2 = start_node_cfg(w2_cfg, Arc::clone(&media), w2_dir).await;

    await_workers_scored(&master_addr, 2).await;

    // Complete a job and confirm the replica landed on the backup node.
    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("durable.mp4");
    let bytes = source_bytes(2 * SEGMENT_BYTES + 99);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(&master_addr, &src, 640, 480, "mp4", RPC_TIMEOUT)
        .await
        .expect("upload");
    client::wait_for_completion(&master_addr, &job_id, POLL, Duration::from_secs(30))
        .await
        .expect("job completes");

    let replica = w1
        .dir
        .path()
        .join("master_data")
        .join("backup")
        .join(&job_id)
        .join("final.mp4");
    let replica_deadline = Instant::now() + Duration::from_secs(10);
    while !replica.exists() {
        assert!(
            Instant::now() < replica_deadline,
            "replica never reached the backup node"
        );
        tokio::time::sleep(POLL).await;
    }
    let expected = expected_final(&bytes, 640, 480, VideoFormat::Mp4);
    assert_eq!(std::fs::read(&replica).unwrap(), expected);

    let before = src_dir.path().join("before.mp4");
    client::retrieve(&master_addr, &job_id, &before, RPC_TIMEOUT)
        .await
        .expect("retrieve from original master");
    assert_eq!(std::fs::read(&before).unwrap(), expected);

    // Kill the master; the workers elect a replacement.
    master.kill();
    let new_master = await_new_master(&w1_addr, &master_addr, Duration::from_secs(10)).await;
    assert!(
        new_master == w1_addr || new_master == w2_addr,
        "unexpected master {new_master}"
    );

    // Both survivors converge on the same master, and only one node claims
    // the role.
    let agree_deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let via_w1 = client::current_master(&w1_addr, RPC_TIMEOUT).await.ok();
        let via_w2 = client::current_master(&w2_addr, RPC_TIMEOUT).await.ok();
        if let (Some((Some(m1), t1)), Some((Some(m2), t2))) = (via_w1, via_w2) {
            if m1 == new_master && m2 == new_master && t1 == t2 {
                break;
            }
        }
        assert!(
            Instant::now() < agree_deadline,
            "survivors never agreed on one master"
        );
        tokio::time::sleep(POLL).await;
    }
    assert!(
        w1.state.election.is_master() ^ w2.state.election.is_master(),
        "exactly one survivor may act as master"
    );

    // The new master restores the completed job and serves identical bytes.
    let status_deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (status, _) = client::status(&new_master, &job_id, RPC_TIMEOUT)
            .await
            .expect("status on new master");
        if status == "completed" {
            break;
        }
        assert!(
            Instant::now() < status_deadline,
            "restored job never reached completed (stuck at {status})"
        );
        tokio::time::sleep(POLL).await;
    }

    let after = src_dir.path().join("after.mp4");
    client::retrieve(&new_master, &job_id, &after, RPC_TIMEOUT)
        .await
        .expect("retrieve from new master");
    assert_eq!(
        std::fs::read(&after).unwrap(),
        expected,
        "failover must serve byte-identical content"
    );

    w1.kill();
    w2.kill();
}

#[tokio::test]
async fn lone_worker_elects_itself_after_master_loss() {
    // With no peers the quorum is one: a single surviving worker detects
    // the silence and promotes itself.
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());

    let master_addr = free_addr();
    let w1_addr = free_addr();

    let master_dir = TempDir::new().unwrap();
    let mut master_cfg = test_config(NodeRole::Master, &master_dir);
    master_cfg.listen_addr = master_addr.clone();
    let master = start_node_cfg(master_cfg, Arc::clone(&media), master_dir).await;

    let w1_dir = TempDir::new().unwrap();
    let mut w1_cfg = test_config(NodeRole::Worker, &w1_dir);
    w1_cfg.listen_addr = w1_addr.clone();
    w1_cfg.master_addr = Some(master_addr.clone());
    let w1 = start_node_cfg(w1_cfg, Arc::clone(&media), w1_dir).await;

    await_workers_scored(&master_addr, 1).await;

    master.kill();

    let new_master = await_new_master(&w1_addr, &master_addr, Duration::from_secs(10)).await;
    assert_eq!(new_master, w1_addr);
    assert!(w1.state.election.is_master());

    w1.kill();
}
