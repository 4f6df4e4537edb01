//! Batch mode: one zipped batch per part, submitted to an async job
//!
//! A round opens an async job, submits every pending part, closes the job
//! and polls until all batches settle. Batches whose result rows report a
//! created record are confirmed; the rest are resubmitted in the next round.

use super::PartUploadCoordinator;
use crate::error::Result;
use crate::remote::{BatchInfo, BatchPayload, BatchState, RemoteService, PART_ENTITY};
use crate::types::FilePart;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A batch accepted by the remote side in the current round.
struct Submitted {
    batch_id: String,
    part_number: u32,
}

impl PartUploadCoordinator {
    /// Returns the number of rounds in which batches were submitted.
    pub(super) async fn upload_batch(&self, job_id: &str, parts: &mut [FilePart]) -> Result<u32> {
        let remote = self.tracker.remote().clone();
        let mut rounds = 0;

        for round in 1..=self.config.max_attempts {
            let pending = self.reconcile(job_id, parts).await?;
            if pending.is_empty() {
                break;
            }
            self.pause_before(round).await;
            rounds = round;

            let async_job = match remote.create_async_job(PART_ENTITY).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(job_id, round, error = %e, "Could not open async job");
                    continue;
                },
            };
            info!(job_id, round, async_job = %async_job, pending = pending.len(), "Submitting batches");

            let mut submitted = Vec::with_capacity(pending.len());
            for part in &pending {
                let data = match tokio::fs::read(&part.path).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(part_number = part.part_number, path = %part.path.display(), error = %e, "Cannot read part file");
                        continue;
                    },
                };
                let payload = BatchPayload {
                    job_id: job_id.to_string(),
                    part_number: part.part_number,
                    file_name: file_name_of(part),
                    data,
                };
                let zipped = payload.to_zip()?;
                match remote.submit_batch(&async_job, zipped).await {
                    Ok(batch_id) => submitted.push(Submitted {
                        batch_id,
                        part_number: part.part_number,
                    }),
                    Err(e) => warn!(part_number = part.part_number, error = %e, "Batch submission failed"),
                }
            }

            if let Err(e) = remote.close_job(&async_job).await {
                warn!(async_job = %async_job, error = %e, "Could not close async job");
            }
            if submitted.is_empty() {
                continue;
            }

            let states = self.poll_until_settled(remote.as_ref(), &async_job, &submitted).await;
            for batch in &submitted {
                let confirmed = match states.get(&batch.batch_id) {
                    Some(info) if info.state == BatchState::Completed => {
                        batch_succeeded(remote.as_ref(), &async_job, batch).await
                    },
                    Some(info) => {
                        warn!(
                            part_number = batch.part_number,
                            state = ?info.state,
                            message = info.message.as_deref().unwrap_or(""),
                            "Batch did not complete"
                        );
                        false
                    },
                    None => {
                        warn!(part_number = batch.part_number, "Batch never settled");
                        false
                    },
                };
                if confirmed {
                    self.confirm(parts, batch.part_number).await?;
                }
            }
        }
        Ok(rounds)
    }

    /// Poll batch status until every submitted batch is terminal or the poll
    /// cap is reached. The first poll is immediate.
    async fn poll_until_settled(
        &self,
        remote: &dyn RemoteService,
        async_job: &str,
        submitted: &[Submitted],
    ) -> HashMap<String, BatchInfo> {
        let mut settled = HashMap::new();
        let mut delay = Duration::ZERO;
        for poll in 1..=self.config.max_polls.max(1) {
            if !delay.is_zero() {
                self.sleeper.sleep(delay).await;
            }
            delay = self.config.poll_interval;

            let infos = match remote.get_batch_status(async_job).await {
                Ok(infos) => infos,
                Err(e) => {
                    warn!(async_job, poll, error = %e, "Batch status poll failed");
                    continue;
                },
            };
            for info in infos {
                if info.state.is_terminal() {
                    settled.insert(info.id.clone(), info);
                }
            }
            let open = submitted.iter().filter(|b| !settled.contains_key(&b.batch_id)).count();
            debug!(async_job, poll, open, "Polled batch status");
            if open == 0 {
                break;
            }
        }
        settled
    }
}

/// A completed batch counts only if a result row reports a created record.
async fn batch_succeeded(remote: &dyn RemoteService, async_job: &str, batch: &Submitted) -> bool {
    match remote.get_batch_result(async_job, &batch.batch_id).await {
        Ok(rows) => {
            if rows.iter().any(|r| r.is_success()) {
                debug!(part_number = batch.part_number, batch_id = %batch.batch_id, "Batch confirmed");
                true
            } else {
                let errors: Vec<&str> = rows.iter().filter_map(|r| r.error.as_deref()).collect();
                warn!(part_number = batch.part_number, errors = ?errors, "Batch result reports failure");
                false
            }
        },
        Err(e) => {
            warn!(part_number = batch.part_number, error = %e, "Could not fetch batch result");
            false
        },
    }
}

fn file_name_of(part: &FilePart) -> String {
    part.path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("part.{}", part.part_number))
}
