//! File-backed hand-off queue for an external worker.
//!
//! One JSON file per job; the file name is the job id. The worker lists the
//! queue and removes an entry once it has processed it.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid queue item name: {0}")]
    InvalidJobId(String),

    #[error("Queue item already exists: {0}")]
    Exists(String),

    #[error("Queue IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// `^[-.a-z0-9]+\.json$`, and no `..` anywhere.
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() > ".json".len()
        && job_id.ends_with(".json")
        && !job_id.contains("..")
        && job_id
            .bytes()
            .all(|b| b == b'-' || b == b'.' || b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    dir: PathBuf,
}

impl JobQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, QueueError> {
        if !is_valid_job_id(job_id) {
            return Err(QueueError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.dir.join(job_id))
    }

    /// Write a job. The file appears under its final name only once complete.
    pub async fn enqueue<T: Serialize>(&self, job_id: &str, payload: &T) -> Result<PathBuf, QueueError> {
        let path = self.path_for(job_id)?;
        if fs::try_exists(&path).await? {
            return Err(QueueError::Exists(job_id.to_string()));
        }
        fs::create_dir_all(&self.dir).await?;

        let encoded = serde_json::to_vec(payload)?;
        let temp_path = self.dir.join(format!("{}.tmp", job_id));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        debug!(job_id, "Queued job");
        Ok(path)
    }

    /// Every parseable job, ordered by file name.
    pub async fn list(&self) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut jobs = Vec::with_capacity(names.len());
        for name in names {
            let bytes = match fs::read(self.dir.join(&name)).await {
                Ok(bytes) => bytes,
                // Removed by the worker between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(file = %name, error = %e, "Skipping unparseable queue item"),
            }
        }
        Ok(jobs)
    }

    /// `Ok(false)` when no such item exists.
    pub async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let path = self.path_for(job_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(job_id, "Removed queue item");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
