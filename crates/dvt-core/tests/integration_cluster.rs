//! Integration: in-process master and workers on loopback, byte-level media
//! executor, full upload → transcode → retrieve round trips.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::cluster::{
    await_workers_scored, source_bytes, start_master, start_worker, POLL, RPC_TIMEOUT,
};
use common::executor::{expected_final, ByteSplitExecutor, SEGMENT_BYTES};
use dvt_core::client::{self, ClientError};
use dvt_core::media::{MediaExecutor, VideoFormat};

const JOB_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn single_worker_happy_path() {
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());
    let master = start_master(Arc::clone(&media), vec![]).await;
    let _worker = start_worker(Arc::clone(&media), master.addr(), vec![], 2, None).await;
    await_workers_scored(master.addr(), 1).await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("holiday.mp4");
    let bytes = source_bytes(3 * SEGMENT_BYTES + 123);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(master.addr(), &src, 640, 480, "mp4", RPC_TIMEOUT)
        .await
        .expect("upload");
    assert_eq!(job_id, "holiday");

    let status = client::wait_for_completion(master.addr(), &job_id, POLL, JOB_DEADLINE)
        .await
        .expect("job completes");
    assert_eq!(status, "completed");

    let out = src_dir.path().join("retrieved.mp4");
    client::retrieve(master.addr(), &job_id, &out, RPC_TIMEOUT)
        .await
        .expect("retrieve");
    assert_eq!(
        std::fs::read(&out).unwrap(),
        expected_final(&bytes, 640, 480, VideoFormat::Mp4),
        "retrieved artifact must contain every shard, transformed, in order"
    );
}

#[tokio::test]
async fn two_worker_load_split_favors_lower_score() {
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());
    let master = start_master(Arc::clone(&media), vec![]).await;
    let fast = start_worker(Arc::clone(&media), master.addr(), vec![], 2, Some(0.1)).await;
    let slow = start_worker(Arc::clone(&media), master.addr(), vec![], 2, Some(0.9)).await;
    await_workers_scored(master.addr(), 2).await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("split.mp4");
    let bytes = source_bytes(3 * SEGMENT_BYTES);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(master.addr(), &src, 320, 240, "mp4", RPC_TIMEOUT)
        .await
        .expect("upload");
    client::wait_for_completion(master.addr(), &job_id, POLL, JOB_DEADLINE)
        .await
        .expect("job completes");

    let shard_inputs = |node: &common::cluster::TestNode| -> usize {
        let dir = node.dir.path().join("worker_scratch").join(&job_id);
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    name.ends_with(".mp4") && !name.contains("_out")
                })
                .count(),
            Err(_) => 0,
        }
    };
    let fast_count = shard_inputs(&fast);
    let slow_count = shard_inputs(&slow);
    assert_eq!(fast_count + slow_count, 3, "all shards dispatched exactly once");
    assert!(
        fast_count >= 2,
        "lower-score worker took {fast_count} of 3 shards"
    );
}

#[tokio::test]
async fn transcode_failure_is_retried_until_success() {
    let exec = Arc::new(ByteSplitExecutor::new());
    let media: Arc<dyn MediaExecutor> = exec.clone();
    let master = start_master(Arc::clone(&media), vec![]).await;
    let _worker = start_worker(Arc::clone(&media), master.addr(), vec![], 2, None).await;
    await_workers_scored(master.addr(), 1).await;

    // First transcode fails; the retried attempt succeeds.
    exec.fail_next_transcodes(1);

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("flaky.mp4");
    let bytes = source_bytes(SEGMENT_BYTES / 2);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(master.addr(), &src, 640, 480, "mp4", RPC_TIMEOUT)
        .await
        .expect("upload");
    let status = client::wait_for_completion(master.addr(), &job_id, POLL, JOB_DEADLINE)
        .await
        .expect("job completes despite one failed attempt");
    assert_eq!(status, "completed");
}

#[tokio::test]
async fn worker_killed_mid_job_shards_are_reassigned() {
    let media: Arc<dyn MediaExecutor> =
        Arc::new(ByteSplitExecutor::with_transcode_delay(Duration::from_millis(300)));
    let master = start_master(Arc::clone(&media), vec![]).await;
    let victim = start_worker(Arc::clone(&media), master.addr(), vec![], 1, None).await;
    let _survivor = start_worker(Arc::clone(&media), master.addr(), vec![], 1, None).await;
    await_workers_scored(master.addr(), 2).await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("resilient.mp4");
    let bytes = source_bytes(4 * SEGMENT_BYTES);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(master.addr(), &src, 640, 480, "mp4", RPC_TIMEOUT)
        .await
        .expect("upload");

    // Let processing start, then take one worker down mid-flight.
    tokio::time::sleep(Duration::from_millis(400)).await;
    victim.kill();

    let status = client::wait_for_completion(master.addr(), &job_id, POLL, JOB_DEADLINE)
        .await
        .expect("job completes on the surviving worker");
    assert_eq!(status, "completed");

    let out = src_dir.path().join("retrieved.mp4");
    client::retrieve(master.addr(), &job_id, &out, RPC_TIMEOUT)
        .await
        .expect("retrieve");
    assert_eq!(
        std::fs::read(&out).unwrap(),
        expected_final(&bytes, 640, 480, VideoFormat::Mp4),
        "no shard may go missing across the reassignment"
    );
}

#[tokio::test]
async fn invalid_parameters_rejected_without_job_record() {
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());
    let master = start_master(Arc::clone(&media), vec![]).await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("bad.mp4");
    std::fs::write(&src, b"payload").unwrap();

    let err = client::upload(master.addr(), &src, 0, 480, "mp4", RPC_TIMEOUT)
        .await
        .expect_err("zero width must be rejected");
    assert!(matches!(err, ClientError::Rejected(_)), "{err}");

    let err = client::upload(master.addr(), &src, 640, 480, "avi", RPC_TIMEOUT)
        .await
        .expect_err("unknown container must be rejected");
    assert!(matches!(err, ClientError::Rejected(_)), "{err}");

    let (status, _) = client::status(master.addr(), "bad", RPC_TIMEOUT)
        .await
        .expect("status");
    assert_eq!(status, "not_found", "rejected upload must not create a job");
}

#[tokio::test]
async fn format_conversion_produces_requested_container() {
    let media: Arc<dyn MediaExecutor> = Arc::new(ByteSplitExecutor::new());
    let master = start_master(Arc::clone(&media), vec![]).await;
    let _worker = start_worker(Arc::clone(&media), master.addr(), vec![], 2, None).await;
    await_workers_scored(master.addr(), 1).await;

    let src_dir = TempDir::new().unwrap();
    let src = src_dir.path().join("convert.mp4");
    let bytes = source_bytes(2 * SEGMENT_BYTES);
    std::fs::write(&src, &bytes).unwrap();

    let job_id = client::upload(master.addr(), &src, 1280, 720, "mkv", RPC_TIMEOUT)
        .await
        .expect("upload");
    client::wait_for_completion(master.addr(), &job_id, POLL, JOB_DEADLINE)
        .await
        .expect("job completes");

    let final_path = master
        .dir
        .path()
        .join("master_data")
        .join(&job_id)
        .join("final.mkv");
    assert!(final_path.exists(), "final.mkv must be published");

    let out = src_dir.path().join("retrieved.mkv");
    client::retrieve(master.addr(), &job_id, &out, RPC_TIMEOUT)
        .await
        .expect("retrieve");
    assert_eq!(
        std::fs::read(&out).unwrap(),
        expected_final(&bytes, 1280, 720, VideoFormat::Mkv)
    );
}
