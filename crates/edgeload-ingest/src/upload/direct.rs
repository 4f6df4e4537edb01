//! Direct mode: one create call per part from a small worker pool

use super::PartUploadCoordinator;
use crate::error::Result;
use crate::remote::{NewRecord, PartRecord, RemoteService};
use crate::types::FilePart;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

impl PartUploadCoordinator {
    /// Returns the number of rounds in which parts were sent.
    pub(super) async fn upload_direct(&self, job_id: &str, parts: &mut [FilePart]) -> Result<u32> {
        let mut rounds = 0;
        for round in 1..=self.config.max_attempts {
            let pending = self.reconcile(job_id, parts).await?;
            if pending.is_empty() {
                break;
            }
            self.pause_before(round).await;
            rounds = round;

            let workers = worker_count(pending.len(), self.config.max_workers);
            info!(job_id, round, pending = pending.len(), workers, "Uploading parts");
            let created = run_workers(self.tracker.remote().clone(), job_id, pending, workers).await;
            debug!(job_id, round, created = created.len(), "Round finished");
            for part_number in created {
                self.confirm(parts, part_number).await?;
            }
        }
        Ok(rounds)
    }
}

/// The pool only fans out when there are more parts than workers.
fn worker_count(pending: usize, max_workers: usize) -> usize {
    if pending > max_workers {
        max_workers.max(1)
    } else {
        1
    }
}

/// Drain `parts` with `workers` tasks sharing one queue. Returns the part
/// numbers whose create succeeded. Failures are logged and left for the
/// next round.
async fn run_workers(
    remote: Arc<dyn RemoteService>,
    job_id: &str,
    parts: Vec<FilePart>,
    workers: usize,
) -> Vec<u32> {
    let (tx, rx) = mpsc::channel(parts.len().max(1));
    for part in parts {
        if tx.send(part).await.is_err() {
            break;
        }
    }
    drop(tx);
    let rx = Arc::new(Mutex::new(rx));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let remote = remote.clone();
            let rx = rx.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut created = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(part) = next else { break };
                    match upload_part(remote.as_ref(), &job_id, &part).await {
                        Ok(()) => created.push(part.part_number),
                        Err(e) => warn!(
                            worker,
                            part_number = part.part_number,
                            error = %e,
                            "Part upload failed"
                        ),
                    }
                }
                created
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .flat_map(|joined| match joined {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "Upload worker panicked");
                Vec::new()
            },
        })
        .collect()
}

async fn upload_part(remote: &dyn RemoteService, job_id: &str, part: &FilePart) -> anyhow::Result<()> {
    let data = tokio::fs::read(&part.path).await?;
    let bytes = data.len();
    let id = remote
        .create_record(&NewRecord::Part(PartRecord {
            job_id: job_id.to_string(),
            part_number: part.part_number,
            data,
        }))
        .await?;
    debug!(part_number = part.part_number, bytes, record_id = %id, "Part created");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::tests::{coordinator, write_parts};
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::types::UploadMode;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_worker_count_degrades_to_one() {
        assert_eq!(worker_count(2, 3), 1);
        assert_eq!(worker_count(3, 3), 1);
        assert_eq!(worker_count(4, 3), 3);
        assert_eq!(worker_count(50, 3), 3);
        assert_eq!(worker_count(5, 0), 1);
    }

    #[tokio::test]
    async fn test_uploads_every_part_once() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        let (coordinator, sleeper) = coordinator(remote.clone(), UploadMode::Direct);

        let parts = write_parts(dir.path(), 7);
        let paths: Vec<_> = parts.iter().map(|p| p.path.clone()).collect();
        let outcome = coordinator.upload(&job, parts).await.unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.uploaded, [1, 2, 3, 4, 5, 6, 7]);
        assert!(outcome.is_complete());
        assert_eq!(remote.uploaded_parts(&job), [1, 2, 3, 4, 5, 6, 7]);
        for n in 1..=7 {
            assert_eq!(remote.create_calls(n), 1);
        }
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_confirmed_parts() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        remote.seed_part(&job, 1);
        remote.seed_part(&job, 3);
        let (coordinator, _) = coordinator(remote.clone(), UploadMode::Direct);

        let outcome = coordinator.upload(&job, write_parts(dir.path(), 4)).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(remote.create_calls(1), 0);
        assert_eq!(remote.create_calls(3), 0);
        assert_eq!(remote.create_calls(2), 1);
        assert_eq!(remote.create_calls(4), 1);
        assert_eq!(remote.uploaded_parts(&job), [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_part_retried_with_backoff() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        remote.fail_part(2, 2);
        let (coordinator, sleeper) = coordinator(remote.clone(), UploadMode::Direct);

        let outcome = coordinator.upload(&job, write_parts(dir.path(), 5)).await.unwrap();

        assert_eq!(outcome.rounds, 3);
        assert!(outcome.is_complete());
        assert_eq!(remote.create_calls(2), 3);
        assert_eq!(remote.create_calls(1), 1);
        assert_eq!(sleeper.delays(), [Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn test_part_left_outstanding_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let job = remote.seed_job("sales");
        remote.fail_part(1, 10);
        let (coordinator, _) = coordinator(remote.clone(), UploadMode::Direct);

        let parts = write_parts(dir.path(), 2);
        let failing = parts[0].path.clone();
        let outcome = coordinator.upload(&job, parts).await.unwrap();

        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.uploaded, [2]);
        assert_eq!(outcome.outstanding, [failing.clone()]);
        assert!(failing.exists());
        assert_eq!(remote.create_calls(1), 3);
    }
}
