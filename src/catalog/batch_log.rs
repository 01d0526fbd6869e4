//! Append-only completion log for import batches.
//!
//! Batches are ephemeral; the only trace they leave is one JSONL line per
//! finished batch, written under an exclusive file lock so concurrent
//! processes never interleave lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use super::CatalogError;
use crate::domain::BatchSummary;

/// JSONL file of finished batch summaries
#[derive(Debug, Clone)]
pub struct BatchLog {
    path: PathBuf,
}

impl BatchLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append a batch summary
    pub async fn append(&self, summary: &BatchSummary) -> Result<(), CatalogError> {
        let line = serde_json::to_string(summary)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || append_locked(&path, &line))
            .await
            .map_err(|e| CatalogError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Replay all summaries in order
    pub async fn replay(&self) -> Result<Vec<BatchSummary>, CatalogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut summaries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            summaries.push(serde_json::from_str(&line)?);
        }

        Ok(summaries)
    }

    /// Most recent batches first
    pub async fn recent(&self, limit: usize) -> Result<Vec<BatchSummary>, CatalogError> {
        let mut all = self.replay().await?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    /// Find a batch by id
    pub async fn find(&self, batch_id: Uuid) -> Result<Option<BatchSummary>, CatalogError> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .find(|s| s.batch_id == batch_id))
    }
}

fn append_locked(path: &Path, line: &str) -> Result<(), CatalogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    // Lock is released when file is dropped
    file.lock_exclusive()?;
    writeln!(file, "{}", line)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchStatus, LocationId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn summary(status: BatchStatus) -> BatchSummary {
        BatchSummary {
            batch_id: Uuid::new_v4(),
            location_id: LocationId::derive("Mill", None),
            status,
            total: 1,
            placed: 1,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let log = BatchLog::new(temp.path().join("nested/batches.jsonl"));

        let first = summary(BatchStatus::Complete);
        let second = summary(BatchStatus::Partial);
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let all = log.replay().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].batch_id, first.batch_id);

        let recent = log.recent(1).await.unwrap();
        assert_eq!(recent[0].status, BatchStatus::Partial);

        assert!(log.find(first.batch_id).await.unwrap().is_some());
        assert!(log.find(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let log = BatchLog::new(temp.path().join("batches.jsonl"));
        assert!(log.replay().await.unwrap().is_empty());
    }
}
