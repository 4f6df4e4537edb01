//! In-process remote
//!
//! Behaves like the real service closely enough for dry runs and tests:
//! jobs and parts are kept in memory, queries page through a cursor, and
//! async batches report `InProgress` on the first status poll and their
//! final state afterwards. Part creates and batches can be told to fail a
//! given number of times, and the uploaded-part listing can be told to lag
//! behind accepted parts.

use super::{
    BatchInfo, BatchPayload, BatchResultRow, BatchState, HeaderUpdate, NewRecord, Query, QueryPage,
    RemoteResult, RemoteService, JOB_ENTITY, PART_ENTITY,
};
use crate::error::RemoteError;
use crate::types::{JobAction, JobStatus, Operation, UploadFormat};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Default rows per query page, as on the real service.
pub const DEFAULT_PAGE_SIZE: usize = 2000;

/// What the memory remote knows about a job header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub id: String,
    pub alias: String,
    pub folder: Option<String>,
    pub format: UploadFormat,
    pub operation: Operation,
    pub metadata: Vec<u8>,
    pub action: JobAction,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredBatch {
    id: String,
    succeeded: bool,
    polls: u32,
}

#[derive(Debug, Default)]
struct AsyncJob {
    batches: Vec<StoredBatch>,
    closed: bool,
}

#[derive(Debug)]
struct State {
    entities: Vec<String>,
    jobs: Vec<StoredJob>,
    parts: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    part_failures: HashMap<u32, u32>,
    batch_failures: HashMap<u32, u32>,
    create_calls: HashMap<u32, u32>,
    listing_lags: bool,
    unlisted: HashMap<String, BTreeSet<u32>>,
    batch_submissions: u32,
    async_jobs: HashMap<String, AsyncJob>,
    cursors: HashMap<String, Vec<serde_json::Value>>,
    page_size: usize,
    clock: DateTime<Utc>,
}

pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entities: vec![JOB_ENTITY.to_string(), PART_ENTITY.to_string()],
                jobs: Vec::new(),
                parts: HashMap::new(),
                part_failures: HashMap::new(),
                batch_failures: HashMap::new(),
                create_calls: HashMap::new(),
                listing_lags: false,
                unlisted: HashMap::new(),
                batch_submissions: 0,
                async_jobs: HashMap::new(),
                cursors: HashMap::new(),
                page_size: DEFAULT_PAGE_SIZE,
                clock: Utc::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    /// Restrict the entity types `describe_entities` reports.
    #[must_use]
    pub fn with_entities(self, entities: &[&str]) -> Self {
        self.state().entities = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Make the next `times` creates of part `part_number` fail.
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.state().part_failures.insert(part_number, times);
    }

    /// Make the next `times` batches carrying `part_number` fail.
    pub fn fail_batch(&self, part_number: u32, times: u32) {
        self.state().batch_failures.insert(part_number, times);
    }

    /// Keep parts accepted from now on out of uploaded-part queries until
    /// [`catch_up_listing`](Self::catch_up_listing).
    pub fn lag_part_listing(&self) {
        self.state().listing_lags = true;
    }

    /// Make every accepted part visible to queries again.
    pub fn catch_up_listing(&self) {
        let mut state = self.state();
        state.listing_lags = false;
        state.unlisted.clear();
    }

    /// Add an incomplete job for `alias` and return its id.
    pub fn seed_job(&self, alias: &str) -> String {
        let mut state = self.state();
        let id = new_id("06V");
        let created = state.tick();
        state.jobs.push(StoredJob {
            id: id.clone(),
            alias: alias.to_string(),
            folder: None,
            format: UploadFormat::Binary,
            operation: Operation::Overwrite,
            metadata: Vec::new(),
            action: JobAction::None,
            status: JobStatus::New,
            created,
        });
        id
    }

    /// Mark `part_number` of `job_id` as already uploaded.
    pub fn seed_part(&self, job_id: &str, part_number: u32) {
        self.state()
            .parts
            .entry(job_id.to_string())
            .or_default()
            .insert(part_number, Vec::new());
    }

    pub fn job(&self, id: &str) -> Option<StoredJob> {
        self.state().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn jobs(&self) -> Vec<StoredJob> {
        self.state().jobs.clone()
    }

    pub fn uploaded_parts(&self, job_id: &str) -> Vec<u32> {
        self.state()
            .parts
            .get(job_id)
            .map(|parts| parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All part bytes received for a job, concatenated in part order.
    pub fn uploaded_bytes(&self, job_id: &str) -> Vec<u8> {
        self.state()
            .parts
            .get(job_id)
            .map(|parts| parts.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Create calls issued for `part_number`, failed ones included.
    pub fn create_calls(&self, part_number: u32) -> u32 {
        self.state().create_calls.get(&part_number).copied().unwrap_or(0)
    }

    pub fn batch_submissions(&self) -> u32 {
        self.state().batch_submissions
    }

    pub fn async_jobs_created(&self) -> usize {
        self.state().async_jobs.len()
    }
}

impl State {
    /// Strictly increasing creation times so "newest first" is well defined.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += ChronoDuration::seconds(1);
        self.clock
    }

    fn store_part(&mut self, job_id: &str, part_number: u32, data: Vec<u8>) {
        self.parts
            .entry(job_id.to_string())
            .or_default()
            .insert(part_number, data);
        if self.listing_lags {
            self.unlisted
                .entry(job_id.to_string())
                .or_default()
                .insert(part_number);
        }
    }

    fn page(&mut self, mut rows: Vec<serde_json::Value>) -> QueryPage {
        if rows.len() <= self.page_size {
            return QueryPage {
                records: rows,
                done: true,
                next_cursor: None,
            };
        }
        let rest = rows.split_off(self.page_size);
        let cursor = new_id("01g");
        self.cursors.insert(cursor.clone(), rest);
        QueryPage {
            records: rows,
            done: false,
            next_cursor: Some(cursor),
        }
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn describe_entities(&self) -> RemoteResult<Vec<String>> {
        Ok(self.state().entities.clone())
    }

    async fn create_record(&self, record: &NewRecord) -> RemoteResult<String> {
        let mut state = self.state();
        match record {
            NewRecord::JobHeader(header) => {
                let id = new_id("06V");
                let created = state.tick();
                state.jobs.push(StoredJob {
                    id: id.clone(),
                    alias: header.alias.clone(),
                    folder: header.folder.clone(),
                    format: header.format,
                    operation: header.operation,
                    metadata: header.metadata.clone(),
                    action: header.action,
                    status: JobStatus::New,
                    created,
                });
                Ok(id)
            },
            NewRecord::Part(part) => {
                *state.create_calls.entry(part.part_number).or_insert(0) += 1;
                if !state.jobs.iter().any(|j| j.id == part.job_id) {
                    return Err(RemoteError::NotFound {
                        kind: "job",
                        id: part.job_id.clone(),
                    });
                }
                if let Some(remaining) = state.part_failures.get_mut(&part.part_number) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(RemoteError::Status {
                            status: 503,
                            message: format!("part {} rejected (injected)", part.part_number),
                        });
                    }
                }
                state.store_part(&part.job_id, part.part_number, part.data.clone());
                Ok(new_id("06W"))
            },
        }
    }

    async fn update_record(&self, job_id: &str, update: &HeaderUpdate) -> RemoteResult<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| RemoteError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        if let Some(ref metadata) = update.metadata {
            job.metadata = metadata.clone();
        }
        if let Some(format) = update.format {
            job.format = format;
        }
        if let Some(operation) = update.operation {
            job.operation = operation;
        }
        if let Some(action) = update.action {
            job.action = action;
            if action == JobAction::Process {
                job.status = JobStatus::Queued;
            }
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> RemoteResult<QueryPage> {
        let mut state = self.state();
        let rows = match query {
            Query::IncompleteJobs { alias } => {
                let mut jobs: Vec<&StoredJob> = state
                    .jobs
                    .iter()
                    .filter(|j| &j.alias == alias && j.status == JobStatus::New && j.action == JobAction::None)
                    .collect();
                jobs.sort_by(|a, b| b.created.cmp(&a.created));
                jobs.into_iter()
                    .map(|j| {
                        json!({
                            "Id": j.id,
                            "Status": j.status.as_str(),
                            "Action": j.action.as_str(),
                            "CreatedDate": j.created.to_rfc3339(),
                        })
                    })
                    .collect()
            },
            Query::UploadedParts { job_id } => {
                let hidden = state.unlisted.get(job_id);
                state
                    .parts
                    .get(job_id)
                    .map(|parts| {
                        parts
                            .keys()
                            .filter(|n| !hidden.is_some_and(|h| h.contains(*n)))
                            .map(|n| json!({ "Id": format!("06W{job_id}{n}"), "PartNumber": n }))
                            .collect()
                    })
                    .unwrap_or_default()
            },
        };
        Ok(state.page(rows))
    }

    async fn query_more(&self, cursor: &str) -> RemoteResult<QueryPage> {
        let mut state = self.state();
        let rows = state.cursors.remove(cursor).ok_or_else(|| RemoteError::NotFound {
            kind: "query cursor",
            id: cursor.to_string(),
        })?;
        Ok(state.page(rows))
    }

    async fn create_async_job(&self, _entity: &str) -> RemoteResult<String> {
        let id = new_id("750");
        self.state().async_jobs.insert(id.clone(), AsyncJob::default());
        Ok(id)
    }

    async fn submit_batch(&self, job_id: &str, payload: Vec<u8>) -> RemoteResult<String> {
        let batch = BatchPayload::from_zip(&payload)?;
        let mut state = self.state();
        state.batch_submissions += 1;

        let succeeded = match state.batch_failures.get_mut(&batch.part_number) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                false
            },
            _ => true,
        };
        if succeeded {
            state.store_part(&batch.job_id, batch.part_number, batch.data);
        }

        let async_job = state.async_jobs.get_mut(job_id).ok_or_else(|| RemoteError::NotFound {
            kind: "async job",
            id: job_id.to_string(),
        })?;
        if async_job.closed {
            return Err(RemoteError::rejected(format!("async job {job_id} is closed")));
        }
        let id = new_id("751");
        async_job.batches.push(StoredBatch {
            id: id.clone(),
            succeeded,
            polls: 0,
        });
        Ok(id)
    }

    async fn close_job(&self, job_id: &str) -> RemoteResult<()> {
        let mut state = self.state();
        let async_job = state.async_jobs.get_mut(job_id).ok_or_else(|| RemoteError::NotFound {
            kind: "async job",
            id: job_id.to_string(),
        })?;
        async_job.closed = true;
        Ok(())
    }

    async fn get_batch_status(&self, job_id: &str) -> RemoteResult<Vec<BatchInfo>> {
        let mut state = self.state();
        let async_job = state.async_jobs.get_mut(job_id).ok_or_else(|| RemoteError::NotFound {
            kind: "async job",
            id: job_id.to_string(),
        })?;
        Ok(async_job
            .batches
            .iter_mut()
            .map(|b| {
                b.polls += 1;
                BatchInfo {
                    id: b.id.clone(),
                    state: if b.polls > 1 {
                        BatchState::Completed
                    } else {
                        BatchState::InProgress
                    },
                    message: None,
                }
            })
            .collect())
    }

    async fn get_batch_result(&self, job_id: &str, batch_id: &str) -> RemoteResult<Vec<BatchResultRow>> {
        let state = self.state();
        let batch = state
            .async_jobs
            .get(job_id)
            .and_then(|j| j.batches.iter().find(|b| b.id == batch_id))
            .ok_or_else(|| RemoteError::NotFound {
                kind: "batch",
                id: batch_id.to_string(),
            })?;
        Ok(vec![if batch.succeeded {
            BatchResultRow {
                id: Some(new_id("06W")),
                success: true,
                created: true,
                error: None,
            }
        } else {
            BatchResultRow {
                id: None,
                success: false,
                created: false,
                error: Some("UNKNOWN_EXCEPTION:injected batch failure".to_string()),
            }
        }])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::remote::{JobHeader, PartRecord};

    fn header(alias: &str) -> NewRecord {
        NewRecord::JobHeader(JobHeader {
            alias: alias.to_string(),
            folder: None,
            label: None,
            format: UploadFormat::Binary,
            operation: Operation::Overwrite,
            metadata: b"{}".to_vec(),
            action: JobAction::None,
        })
    }

    #[tokio::test]
    async fn test_incomplete_jobs_newest_first() {
        let remote = MemoryRemote::new();
        let older = remote.create_record(&header("sales")).await.unwrap();
        let newer = remote.create_record(&header("sales")).await.unwrap();
        remote.create_record(&header("other")).await.unwrap();

        let page = remote
            .query(&Query::IncompleteJobs { alias: "sales".into() })
            .await
            .unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r["Id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, [newer.clone(), older]);

        let finalize = HeaderUpdate {
            action: Some(JobAction::Process),
            ..Default::default()
        };
        remote.update_record(&newer, &finalize).await.unwrap();
        let page = remote
            .query(&Query::IncompleteJobs { alias: "sales".into() })
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
    }

    #[tokio::test]
    async fn test_part_paging_and_failures() {
        let remote = MemoryRemote::new().with_page_size(2);
        let job = remote.seed_job("sales");
        remote.fail_part(2, 1);

        for n in 1..=5 {
            let part = NewRecord::Part(PartRecord {
                job_id: job.clone(),
                part_number: n,
                data: vec![n as u8],
            });
            let result = remote.create_record(&part).await;
            assert_eq!(result.is_err(), n == 2);
        }
        assert_eq!(remote.create_calls(2), 1);

        let first = remote.query(&Query::UploadedParts { job_id: job.clone() }).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(!first.done);
        let second = remote.query_more(first.next_cursor.as_deref().unwrap()).await.unwrap();
        assert!(second.done);
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[1]["PartNumber"], 5);
        assert!(remote.query_more("unknown").await.is_err());
    }

    #[tokio::test]
    async fn test_batches_settle_on_second_poll() {
        let remote = MemoryRemote::new();
        let job = remote.seed_job("sales");
        remote.fail_batch(1, 1);

        let async_job = remote.create_async_job(PART_ENTITY).await.unwrap();
        let payload = BatchPayload {
            job_id: job.clone(),
            part_number: 1,
            file_name: "a.gz.1".into(),
            data: vec![1, 2, 3],
        };
        let batch = remote.submit_batch(&async_job, payload.to_zip().unwrap()).await.unwrap();
        remote.close_job(&async_job).await.unwrap();

        let first = remote.get_batch_status(&async_job).await.unwrap();
        assert_eq!(first[0].state, BatchState::InProgress);
        let second = remote.get_batch_status(&async_job).await.unwrap();
        assert_eq!(second[0].state, BatchState::Completed);

        let rows = remote.get_batch_result(&async_job, &batch).await.unwrap();
        assert!(!rows[0].is_success());
        assert!(remote.uploaded_parts(&job).is_empty());
        assert!(remote.submit_batch(&async_job, payload.to_zip().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_lagging_listing_hides_new_parts() {
        let remote = MemoryRemote::new();
        let job = remote.seed_job("sales");
        remote.seed_part(&job, 1);
        remote.lag_part_listing();
        let part = NewRecord::Part(PartRecord {
            job_id: job.clone(),
            part_number: 2,
            data: vec![2],
        });
        remote.create_record(&part).await.unwrap();

        let listed = remote.query(&Query::UploadedParts { job_id: job.clone() }).await.unwrap();
        assert_eq!(listed.records.len(), 1);
        assert_eq!(listed.records[0]["PartNumber"], 1);
        assert_eq!(remote.uploaded_parts(&job), [1, 2]);

        remote.catch_up_listing();
        let listed = remote.query(&Query::UploadedParts { job_id: job }).await.unwrap();
        assert_eq!(listed.records.len(), 2);
    }
}
