//! On-disk layout and temp-file publication.
//!
//! Scratch directories are partitioned per job and per shard so concurrent
//! pipelines never share paths; atomic rename is the only publication
//! primitive. Incomplete `.part` files are left behind on failure for
//! operator inspection and are never served.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::job::{JobId, ShardIndex};
use crate::media::VideoFormat;

/// Resolves every path a node reads or writes under its data root.
#[derive(Debug, Clone)]
pub struct NodePaths {
    root: PathBuf,
}

impl NodePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uploaded source file (master).
    pub fn source(&self, job: &str) -> PathBuf {
        self.root.join("video_shards").join(job).join("source")
    }

    /// Directory the segmenter writes source shards into (master).
    pub fn shard_dir(&self, job: &str) -> PathBuf {
        self.root.join("video_shards").join(job)
    }

    /// One source shard (master).
    pub fn source_shard(&self, job: &str, index: ShardIndex) -> PathBuf {
        self.shard_dir(job).join(format!("{index}.mp4"))
    }

    /// One collected processed shard (master).
    pub fn processed_shard(&self, job: &str, index: ShardIndex, format: VideoFormat) -> PathBuf {
        self.root
            .join("master_data")
            .join(job)
            .join(format!("processed_{index}.{}", format.as_str()))
    }

    /// Published final artifact (master).
    pub fn final_artifact(&self, job: &str, format: VideoFormat) -> PathBuf {
        self.root
            .join("master_data")
            .join(job)
            .join(format!("final.{}", format.as_str()))
    }

    /// Replicated artifact (backup node).
    pub fn backup_artifact(&self, job: &str, format: VideoFormat) -> PathBuf {
        self.root
            .join("master_data")
            .join("backup")
            .join(job)
            .join(format!("final.{}", format.as_str()))
    }

    /// Directory holding replicas, scanned by `ListBackups`.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("master_data").join("backup")
    }

    /// Shard input received by a worker.
    pub fn worker_shard_in(&self, job: &str, index: ShardIndex, attempt: u32) -> PathBuf {
        self.root
            .join("worker_scratch")
            .join(job)
            .join(format!("{index}_{attempt}.mp4"))
    }

    /// Transcoded shard produced by a worker. Keyed by attempt so repeating
    /// an attempt replaces its own output and nothing else.
    pub fn worker_shard_out(
        &self,
        job: &str,
        index: ShardIndex,
        attempt: u32,
        format: VideoFormat,
    ) -> PathBuf {
        self.root
            .join("worker_scratch")
            .join(job)
            .join(format!("{index}_{attempt}_out.{}", format.as_str()))
    }

    /// Remove a job's directories on this node (eviction / overwrite).
    pub async fn remove_job(&self, job: &JobId) -> Result<()> {
        for dir in [
            self.shard_dir(job),
            self.root.join("master_data").join(job),
            self.root.join("worker_scratch").join(job),
        ] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("remove {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// JobIds present in the backup store, with the replica path and format.
    pub fn list_backups(&self) -> Vec<(JobId, PathBuf, VideoFormat)> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.backup_dir()) else {
            return found;
        };
        for entry in entries.flatten() {
            let job_id = entry.file_name().to_string_lossy().into_owned();
            for format in [
                VideoFormat::Mp4,
                VideoFormat::Mkv,
                VideoFormat::Webm,
                VideoFormat::Mov,
            ] {
                let path = self.backup_artifact(&job_id, format);
                if path.exists() {
                    found.push((job_id.clone(), path, format));
                    break;
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

/// Sequential writer for a streamed receipt. Writes to `<final>.part` and
/// publishes with an atomic rename; call `finalize` only after the stream
/// completed cleanly.
pub struct TempWriter {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl TempWriter {
    pub async fn create(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }
        let temp_path = temp_path_for(final_path);
        let file = File::create(&temp_path)
            .await
            .with_context(|| format!("create temp file {}", temp_path.display()))?;
        Ok(Self {
            file,
            temp_path,
            final_path: final_path.to_path_buf(),
        })
    }

    /// The open temp file, for `Connection::recv_stream`.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// fsync and atomically rename into the final path.
    pub async fn finalize(mut self) -> Result<PathBuf> {
        self.file.flush().await.context("flush temp file")?;
        self.file.sync_all().await.context("fsync temp file")?;
        drop(self.file);
        tokio::fs::rename(&self.temp_path, &self.final_path)
            .await
            .with_context(|| {
                format!(
                    "rename {} to {}",
                    self.temp_path.display(),
                    self.final_path.display()
                )
            })?;
        Ok(self.final_path)
    }

    /// Abandon the receipt, leaving the `.part` file for inspection.
    pub fn abandon(self) -> PathBuf {
        self.temp_path
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(".part");
    final_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn paths_are_job_and_shard_partitioned() {
        let paths = NodePaths::new("/data");
        assert_eq!(
            paths.source_shard("job", 3),
            PathBuf::from("/data/video_shards/job/3.mp4")
        );
        assert_eq!(
            paths.final_artifact("job", VideoFormat::Mkv),
            PathBuf::from("/data/master_data/job/final.mkv")
        );
        assert_eq!(
            paths.backup_artifact("job", VideoFormat::Mp4),
            PathBuf::from("/data/master_data/backup/job/final.mp4")
        );
        assert_ne!(
            paths.worker_shard_out("job", 0, 1, VideoFormat::Mp4),
            paths.worker_shard_out("job", 0, 2, VideoFormat::Mp4)
        );
    }

    #[tokio::test]
    async fn finalize_publishes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out").join("final.mp4");

        let mut writer = TempWriter::create(&final_path).await.unwrap();
        writer.file_mut().write_all(b"payload").await.unwrap();
        assert!(!final_path.exists(), "not visible before finalize");

        let published = writer.finalize().await.unwrap();
        assert_eq!(published, final_path);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"payload");
        assert!(!temp_path_for(&final_path).exists());
    }

    #[tokio::test]
    async fn abandon_leaves_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("final.mp4");
        let mut writer = TempWriter::create(&final_path).await.unwrap();
        writer.file_mut().write_all(b"partial").await.unwrap();
        let part = writer.abandon();
        assert!(part.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn backup_listing_finds_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        let replica = paths.backup_artifact("clip", VideoFormat::Webm);
        tokio::fs::create_dir_all(replica.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&replica, b"x").await.unwrap();

        let found = paths.list_backups();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "clip");
        assert_eq!(found[0].2, VideoFormat::Webm);
    }
}
