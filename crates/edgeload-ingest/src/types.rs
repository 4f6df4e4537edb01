//! Core types shared by the job tracker, the upload coordinator and the CLI

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Shape of the digested artifact the remote side will ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UploadFormat {
    Csv,
    #[default]
    Binary,
}

impl UploadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadFormat::Csv => "Csv",
            UploadFormat::Binary => "Binary",
        }
    }
}

impl std::str::FromStr for UploadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(UploadFormat::Csv),
            "binary" | "bin" => Ok(UploadFormat::Binary),
            other => Err(format!("unknown upload format '{other}' (expected csv or binary)")),
        }
    }
}

/// How the remote side merges the upload into an existing dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Operation {
    #[default]
    Overwrite,
    Append,
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Overwrite => "Overwrite",
            Operation::Append => "Append",
            Operation::Upsert => "Upsert",
            Operation::Delete => "Delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Operation::Overwrite),
            "append" => Ok(Operation::Append),
            "upsert" => Ok(Operation::Upsert),
            "delete" => Ok(Operation::Delete),
            other => Err(format!(
                "unknown operation '{other}' (expected overwrite, append, upsert or delete)"
            )),
        }
    }
}

/// Job header action. `Process` hands the job over to remote ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobAction {
    #[default]
    None,
    Process,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::None => "None",
            JobAction::Process => "Process",
        }
    }
}

impl From<&str> for JobAction {
    fn from(s: &str) -> Self {
        match s {
            "Process" => JobAction::Process,
            _ => JobAction::None,
        }
    }
}

/// Remote job status as reported by the data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Queued,
    InProgress,
    Completed,
    CompletedWithWarnings,
    Failed,
    NotProcessed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "New",
            JobStatus::Queued => "Queued",
            JobStatus::InProgress => "InProgress",
            JobStatus::Completed => "Completed",
            JobStatus::CompletedWithWarnings => "CompletedWithWarnings",
            JobStatus::Failed => "Failed",
            JobStatus::NotProcessed => "NotProcessed",
        }
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "Queued" => JobStatus::Queued,
            "InProgress" => JobStatus::InProgress,
            "Completed" => JobStatus::Completed,
            "CompletedWithWarnings" => JobStatus::CompletedWithWarnings,
            "Failed" => JobStatus::Failed,
            "NotProcessed" => JobStatus::NotProcessed,
            _ => JobStatus::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    Uploaded,
}

/// One numbered slice of the artifact on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub part_number: u32,
    pub path: PathBuf,
    pub state: PartState,
}

impl FilePart {
    pub fn pending(part_number: u32, path: PathBuf) -> Self {
        Self {
            part_number,
            path,
            state: PartState::Pending,
        }
    }
}

/// Which upload strategy the coordinator uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadMode {
    /// One create call per part from a small worker pool
    #[default]
    Direct,
    /// Zipped batches submitted to an async job, then polled
    Batch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_and_operation() {
        assert_eq!("CSV".parse::<UploadFormat>(), Ok(UploadFormat::Csv));
        assert_eq!("binary".parse::<UploadFormat>(), Ok(UploadFormat::Binary));
        assert!("parquet".parse::<UploadFormat>().is_err());
        assert_eq!("Append".parse::<Operation>(), Ok(Operation::Append));
        assert!("merge".parse::<Operation>().is_err());
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [JobStatus::New, JobStatus::InProgress, JobStatus::Failed] {
            assert_eq!(JobStatus::from(status.as_str()), status);
        }
        assert_eq!(JobAction::from("Process"), JobAction::Process);
        assert_eq!(JobAction::from("anything"), JobAction::None);
    }
}
