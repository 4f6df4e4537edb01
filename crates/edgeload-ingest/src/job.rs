//! Remote job lifecycle
//!
//! A job is created with action `None` and stays resumable until it is
//! finalized with action `Process`. The set of uploaded part numbers is
//! always read back from the remote side; nothing here caches it.

use crate::error::{LoaderError, RemoteError, Result};
use crate::remote::{
    HeaderUpdate, JobHeader, NewRecord, Query, QueryPage, RemoteService, JOB_ENTITY, PART_ENTITY,
};
use crate::types::{JobAction, JobStatus};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobRow {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    created_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PartRow {
    part_number: f64,
}

/// A job found for an alias that can still take parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableJob {
    pub id: String,
    pub status: JobStatus,
    pub action: JobAction,
    pub created_date: Option<String>,
}

#[derive(Clone)]
pub struct JobStateTracker {
    remote: Arc<dyn RemoteService>,
}

impl JobStateTracker {
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    /// Fail with [`LoaderError::RemoteAccess`] unless both the job and part
    /// entity types are visible.
    pub async fn check_access(&self) -> Result<()> {
        let visible = self.remote.describe_entities().await?;
        let missing: Vec<String> = [JOB_ENTITY, PART_ENTITY]
            .iter()
            .filter(|e| !visible.iter().any(|v| v == *e))
            .map(|e| e.to_string())
            .collect();
        if missing.is_empty() {
            debug!("Remote entity access confirmed");
            Ok(())
        } else {
            Err(LoaderError::RemoteAccess { missing })
        }
    }

    /// Newest job for `alias` still in status New with action None.
    #[instrument(skip(self))]
    pub async fn find_resumable_job(&self, alias: &str) -> Result<Option<ResumableJob>> {
        let rows: Vec<JobRow> = self
            .collect_rows(Query::IncompleteJobs {
                alias: alias.to_string(),
            })
            .await?;

        if rows.len() > 1 {
            warn!(
                alias,
                count = rows.len(),
                "More than one incomplete job for alias, resuming the newest"
            );
        }

        Ok(rows.into_iter().next().map(|row| ResumableJob {
            id: row.id,
            status: row.status.as_deref().map(JobStatus::from).unwrap_or(JobStatus::New),
            action: row.action.as_deref().map(JobAction::from).unwrap_or_default(),
            created_date: row.created_date,
        }))
    }

    /// Create a fresh job header and return its id.
    pub async fn create_job(&self, header: JobHeader) -> Result<String> {
        let alias = header.alias.clone();
        let id = self.remote.create_record(&NewRecord::JobHeader(header)).await?;
        info!(job_id = %id, alias, "Created job");
        Ok(id)
    }

    /// Part numbers the remote side already holds for `job_id`.
    pub async fn list_uploaded_parts(&self, job_id: &str) -> Result<BTreeSet<u32>> {
        let rows: Vec<PartRow> = self
            .collect_rows(Query::UploadedParts {
                job_id: job_id.to_string(),
            })
            .await?;
        let parts: BTreeSet<u32> = rows.into_iter().map(|r| r.part_number as u32).collect();
        debug!(job_id, uploaded = parts.len(), "Listed uploaded parts");
        Ok(parts)
    }

    /// Apply the `Some` fields of `update`. An empty update makes no call.
    pub async fn update_header(&self, job_id: &str, update: HeaderUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.remote.update_record(job_id, &update).await?;
        Ok(())
    }

    /// Hand the job to remote processing. Only call once every part is
    /// confirmed.
    pub async fn finalize(&self, job_id: &str) -> Result<()> {
        self.update_header(
            job_id,
            HeaderUpdate {
                action: Some(JobAction::Process),
                ..Default::default()
            },
        )
        .await?;
        info!(job_id, "Job finalized for processing");
        Ok(())
    }

    /// Run `query` and follow cursors until the last page.
    async fn collect_rows<T>(&self, query: Query) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut rows = Vec::new();
        let mut page = self.remote.query(&query).await?;
        loop {
            let QueryPage {
                records,
                done,
                next_cursor,
            } = page;
            for record in records {
                let row = serde_json::from_value(record)
                    .map_err(|e| RemoteError::decode(format!("query row: {e}")))?;
                rows.push(row);
            }
            match (done, next_cursor) {
                (false, Some(cursor)) => page = self.remote.query_more(&cursor).await?,
                _ => break,
            }
        }
        Ok(rows)
    }
}
