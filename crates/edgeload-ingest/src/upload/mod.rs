//! Part upload coordination
//!
//! Both strategies work in rounds. Each round starts by asking the remote
//! side which part numbers it already holds, deletes the local files of
//! confirmed parts and only sends the rest. A part is never deleted locally
//! before the remote side confirms it, so an interrupted run can always be
//! resumed from whatever files are left on disk.

mod batch;
mod direct;
pub mod retry;

pub use retry::{backoff, RecordingSleeper, Sleeper, TokioSleeper};

use crate::error::Result;
use crate::job::JobStateTracker;
use crate::types::{FilePart, PartState, UploadMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of concurrent direct-mode workers.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Default rounds before giving up on a part.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between batch status polls in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default cap on status polls per batch round.
pub const DEFAULT_MAX_POLLS: u32 = 360;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub mode: UploadMode,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: UploadMode::Direct,
            max_workers: DEFAULT_MAX_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(retry::RETRY_DELAY_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

/// Result of an upload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Rounds in which at least one part was sent
    pub rounds: u32,
    /// Part numbers confirmed by the remote side
    pub uploaded: Vec<u32>,
    /// Local files of parts still unconfirmed
    pub outstanding: Vec<PathBuf>,
}

impl UploadOutcome {
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }
}

pub struct PartUploadCoordinator {
    tracker: JobStateTracker,
    config: UploadConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl PartUploadCoordinator {
    pub fn new(tracker: JobStateTracker, config: UploadConfig) -> Self {
        Self {
            tracker,
            config,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload every part of `parts` not yet held by `job_id`.
    ///
    /// Failures on individual parts, remote or local, are retried and end up
    /// in [`UploadOutcome::outstanding`]. Only a failure to read the uploaded
    /// part list or to delete a confirmed part file aborts the run.
    #[tracing::instrument(skip_all, fields(job_id = %job_id, parts = parts.len(), mode = ?self.config.mode))]
    pub async fn upload(&self, job_id: &str, mut parts: Vec<FilePart>) -> Result<UploadOutcome> {
        let rounds = match self.config.mode {
            UploadMode::Direct => self.upload_direct(job_id, &mut parts).await?,
            UploadMode::Batch => self.upload_batch(job_id, &mut parts).await?,
        };

        let outstanding: Vec<PathBuf> = self
            .reconcile(job_id, &mut parts)
            .await?
            .into_iter()
            .map(|p| p.path)
            .collect();
        let uploaded: Vec<u32> = parts
            .iter()
            .filter(|p| p.state == PartState::Uploaded)
            .map(|p| p.part_number)
            .collect();

        if outstanding.is_empty() {
            info!(job_id, rounds, uploaded = uploaded.len(), "All parts uploaded");
        } else {
            warn!(
                job_id,
                rounds,
                outstanding = outstanding.len(),
                "Parts remain unconfirmed after all attempts"
            );
        }
        Ok(UploadOutcome {
            rounds,
            uploaded,
            outstanding,
        })
    }

    /// Mark parts the remote side lists as uploaded, delete their local
    /// files and return the parts still pending.
    ///
    /// The listing is re-read every call and may lag behind creates that
    /// already succeeded. A part confirmed by its own create call or batch
    /// result stays uploaded even when the listing does not show it yet.
    async fn reconcile(&self, job_id: &str, parts: &mut [FilePart]) -> Result<Vec<FilePart>> {
        let listed = self.tracker.list_uploaded_parts(job_id).await?;
        let mut pending = Vec::new();
        let mut unlisted = 0usize;
        for part in parts.iter_mut() {
            match (part.state, listed.contains(&part.part_number)) {
                (PartState::Pending, true) => {
                    remove_part_file(&part.path).await?;
                    part.state = PartState::Uploaded;
                },
                (PartState::Pending, false) => pending.push(part.clone()),
                (PartState::Uploaded, true) => {},
                (PartState::Uploaded, false) => unlisted += 1,
            }
        }
        debug!(
            job_id,
            listed = listed.len(),
            unlisted,
            pending = pending.len(),
            "Reconciled parts"
        );
        Ok(pending)
    }

    /// Record a part the remote side accepted in this run and drop its file.
    async fn confirm(&self, parts: &mut [FilePart], part_number: u32) -> Result<()> {
        if let Some(part) = parts.iter_mut().find(|p| p.part_number == part_number) {
            remove_part_file(&part.path).await?;
            part.state = PartState::Uploaded;
        }
        Ok(())
    }

    async fn pause_before(&self, round: u32) {
        if round > 1 {
            let delay = backoff(self.config.retry_base, round - 1);
            debug!(round, ?delay, "Backing off before retry round");
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Delete an uploaded part. A file that is already gone is fine.
async fn remove_part_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use tempfile::TempDir;

    /// Write `count` small part files and return them as pending parts.
    pub(crate) fn write_parts(dir: &Path, count: u32) -> Vec<FilePart> {
        (1..=count)
            .map(|n| {
                let path = dir.join(format!("job.sales.gz.{n}"));
                std::fs::write(&path, format!("part-{n}")).unwrap();
                FilePart::pending(n, path)
            })
            .collect()
    }

    pub(crate) fn coordinator(remote: Arc<MemoryRemote>, mode: UploadMode) -> (PartUploadCoordinator, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let config = UploadConfig {
            mode,
            ..Default::default()
        };
        let coordinator =
            PartUploadCoordinator::new(JobStateTracker::new(remote), config).with_sleeper(sleeper.clone());
        (coordinator, sleeper)
    }

    #[tokio::test]
    async fn test_reconcile_deletes_confirmed_parts_only() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        remote.seed_part(&job, 2);
        let (coordinator, _) = coordinator(remote, UploadMode::Direct);

        let mut parts = write_parts(dir.path(), 3);
        let pending = coordinator.reconcile(&job, &mut parts).await.unwrap();

        assert_eq!(pending.iter().map(|p| p.part_number).collect::<Vec<_>>(), [1, 3]);
        assert!(parts[0].path.exists());
        assert!(!parts[1].path.exists());
        assert_eq!(parts[1].state, PartState::Uploaded);
    }

    #[tokio::test]
    async fn test_nothing_to_do_when_all_parts_confirmed() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        remote.seed_part(&job, 1);
        remote.seed_part(&job, 2);

        for mode in [UploadMode::Direct, UploadMode::Batch] {
            let (coordinator, sleeper) = coordinator(remote.clone(), mode);
            let outcome = coordinator.upload(&job, write_parts(dir.path(), 2)).await.unwrap();
            assert_eq!(outcome.rounds, 0);
            assert_eq!(outcome.uploaded, [1, 2]);
            assert!(outcome.is_complete());
            assert!(sleeper.delays().is_empty());
        }
        assert_eq!(remote.create_calls(1), 0);
        assert_eq!(remote.batch_submissions(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_parts_confirmed_in_this_run() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        let (coordinator, _) = coordinator(remote, UploadMode::Batch);

        let mut parts = write_parts(dir.path(), 2);
        coordinator.confirm(&mut parts, 1).await.unwrap();
        assert!(!parts[0].path.exists());

        // the listing knows neither part yet
        let pending = coordinator.reconcile(&job, &mut parts).await.unwrap();
        assert_eq!(pending.iter().map(|p| p.part_number).collect::<Vec<_>>(), [2]);
        assert_eq!(parts[0].state, PartState::Uploaded);
    }
}

