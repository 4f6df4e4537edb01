//! Remote data store interface
//!
//! [`RemoteService`] is the set of calls the pipeline needs from the data
//! store: single-record create/update, paged queries, and the async batch
//! API. [`HttpRemote`] talks to the real REST surface; [`MemoryRemote`] keeps
//! everything in process for dry runs and tests.

pub mod http;
pub mod memory;
pub mod payload;

pub use http::HttpRemote;
pub use memory::MemoryRemote;
pub use payload::BatchPayload;

use crate::error::RemoteError;
use crate::types::{JobAction, Operation, UploadFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Entity holding one job header per upload
pub const JOB_ENTITY: &str = "InsightsExternalData";

/// Entity holding one row per uploaded part
pub const PART_ENTITY: &str = "InsightsExternalDataPart";

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Fields of a new job header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeader {
    pub alias: String,
    pub folder: Option<String>,
    pub label: Option<String>,
    pub format: UploadFormat,
    pub operation: Operation,
    /// Persisted schema bytes
    pub metadata: Vec<u8>,
    pub action: JobAction,
}

/// One part of the artifact attached to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub job_id: String,
    pub part_number: u32,
    pub data: Vec<u8>,
}

/// Records the pipeline creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewRecord {
    JobHeader(JobHeader),
    Part(PartRecord),
}

impl NewRecord {
    pub fn entity(&self) -> &'static str {
        match self {
            NewRecord::JobHeader(_) => JOB_ENTITY,
            NewRecord::Part(_) => PART_ENTITY,
        }
    }
}

/// Partial job header update. Only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderUpdate {
    pub metadata: Option<Vec<u8>>,
    pub format: Option<UploadFormat>,
    pub operation: Option<Operation>,
    pub action: Option<JobAction>,
}

impl HeaderUpdate {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.format.is_none() && self.operation.is_none() && self.action.is_none()
    }
}

/// The reads the pipeline issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Jobs for an alias still waiting for parts, newest first
    IncompleteJobs { alias: String },
    /// Part numbers already attached to a job, ascending
    UploadedParts { job_id: String },
}

impl Query {
    pub fn to_soql(&self) -> String {
        match self {
            Query::IncompleteJobs { alias } => format!(
                "SELECT Id, Status, Action, CreatedDate FROM {JOB_ENTITY} \
                 WHERE EdgemartAlias='{}' AND Status='New' AND Action='None' \
                 ORDER BY CreatedDate DESC",
                escape_literal(alias)
            ),
            Query::UploadedParts { job_id } => format!(
                "SELECT Id, PartNumber FROM {PART_ENTITY} \
                 WHERE InsightsExternalDataId='{}' ORDER BY PartNumber ASC",
                escape_literal(job_id)
            ),
        }
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// One page of query results. Rows keep the remote field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub records: Vec<serde_json::Value>,
    pub done: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Queued,
    InProgress,
    Completed,
    Failed,
    #[serde(rename = "Not Processed")]
    NotProcessed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed | BatchState::NotProcessed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub id: String,
    pub state: BatchState,
    pub message: Option<String>,
}

/// One row of a batch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResultRow {
    pub id: Option<String>,
    pub success: bool,
    pub created: bool,
    pub error: Option<String>,
}

impl BatchResultRow {
    pub fn is_success(&self) -> bool {
        self.success && self.created
    }
}

/// Remote data store operations used by the pipeline.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Names of the entity types visible to the caller
    async fn describe_entities(&self) -> RemoteResult<Vec<String>>;

    /// Create one record and return its id
    async fn create_record(&self, record: &NewRecord) -> RemoteResult<String>;

    async fn update_record(&self, job_id: &str, update: &HeaderUpdate) -> RemoteResult<()>;

    async fn query(&self, query: &Query) -> RemoteResult<QueryPage>;

    async fn query_more(&self, cursor: &str) -> RemoteResult<QueryPage>;

    /// Open an async job that inserts into `entity`
    async fn create_async_job(&self, entity: &str) -> RemoteResult<String>;

    /// Submit one zipped batch, returning the batch id
    async fn submit_batch(&self, job_id: &str, payload: Vec<u8>) -> RemoteResult<String>;

    async fn close_job(&self, job_id: &str) -> RemoteResult<()>;

    async fn get_batch_status(&self, job_id: &str) -> RemoteResult<Vec<BatchInfo>>;

    async fn get_batch_result(&self, job_id: &str, batch_id: &str) -> RemoteResult<Vec<BatchResultRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_render_soql() {
        let q = Query::IncompleteJobs { alias: "sales".into() };
        assert_eq!(
            q.to_soql(),
            "SELECT Id, Status, Action, CreatedDate FROM InsightsExternalData \
             WHERE EdgemartAlias='sales' AND Status='New' AND Action='None' ORDER BY CreatedDate DESC"
        );
        let q = Query::UploadedParts { job_id: "06V1".into() };
        assert!(q.to_soql().ends_with("WHERE InsightsExternalDataId='06V1' ORDER BY PartNumber ASC"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let q = Query::UploadedParts { job_id: "x' OR '1'='1".into() };
        assert!(q.to_soql().contains(r"'x\' OR \'1\'=\'1'"));
    }

    #[test]
    fn test_batch_state_terminality() {
        assert!(!BatchState::Queued.is_terminal());
        assert!(!BatchState::InProgress.is_terminal());
        assert!(BatchState::Completed.is_terminal());
        assert!(BatchState::Failed.is_terminal());
        assert!(BatchState::NotProcessed.is_terminal());
        assert_eq!(serde_json::to_string(&BatchState::NotProcessed).unwrap_or_default(), "\"Not Processed\"");
    }

    #[test]
    fn test_empty_update() {
        assert!(HeaderUpdate::default().is_empty());
        let update = HeaderUpdate {
            action: Some(JobAction::Process),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
