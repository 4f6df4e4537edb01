//! Error types for the ingestion pipeline
//!
//! Each phase has its own error enum; [`LoaderError`] is what the pipeline
//! hands back to callers. Row-level problems are not errors of the run: they
//! travel as [`RowEncodingError`] into the error sink and only show up in
//! counts.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Invalid field or schema definition. Always raised before any row is read.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid field name '{0}': must start with a letter, contain only letters, digits or '_', and be at most 255 characters")]
    InvalidName(String),

    #[error("Duplicate field name '{0}'")]
    DuplicateName(String),

    #[error("Schema has no fields")]
    Empty,

    #[error("Field '{field}': invalid date format '{format}': {reason}")]
    InvalidDateFormat {
        field: String,
        format: String,
        reason: String,
    },

    #[error("Field '{field}': date fields need a format")]
    MissingDateFormat { field: String },

    #[error("Field '{field}': default value '{value}' is not valid for a {kind} field: {reason}")]
    InvalidDefault {
        field: String,
        value: String,
        kind: String,
        reason: String,
    },

    #[error("Field '{field}': computed expression does not compile: {reason}")]
    InvalidExpression { field: String, reason: String },

    #[error("Field '{field}': computed expression references unknown field '{reference}'")]
    UnknownReference { field: String, reference: String },

    #[error("Field '{field}': {reason}")]
    InvalidAttribute { field: String, reason: String },

    #[error("Malformed schema description: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read header row: {0}")]
    Header(String),
}

impl SchemaError {
    pub fn attribute(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Why a cell was rejected. Only [`RowErrorKind::Unparsable`] cells fall
/// back to a field default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowErrorKind {
    #[default]
    Invalid,
    /// The text is not a number or date at all
    Unparsable,
    /// A well-formed value that does not fit the field
    OutOfRange,
}

/// A single row could not be encoded. Recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field '{field}': {reason}")]
pub struct RowEncodingError {
    pub field: String,
    pub reason: String,
    pub kind: RowErrorKind,
}

impl RowEncodingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
            kind: RowErrorKind::Invalid,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: RowErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Error, Debug)]
pub enum SortError {
    #[error("Failed to create temporary sort storage: {0}")]
    TempStorage(std::io::Error),

    #[error("Sort I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read or write delimited rows: {0}")]
    Csv(#[from] csv::Error),

    #[error("Character set '{0}' is not ASCII compatible and cannot be sorted as delimited bytes")]
    UnsupportedCharset(String),
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Cannot read artifact '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact '{0}' is empty, refusing to upload nothing")]
    Empty(PathBuf),

    #[error("Failed to write part file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure talking to the remote data store.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Network request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Remote service rejected the request: {0}")]
    Rejected(String),

    #[error("Unexpected response from remote service: {0}")]
    Decode(String),

    #[error("Unknown {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },
}

impl RemoteError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Top-level failure of an ingestion run.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Input is not valid text encoding for charset {charset} (row {row}). Re-run with the correct --charset")]
    StreamEncoding { row: u64, charset: String },

    #[error("Every row failed to encode, nothing to upload. See {}", error_file_hint(.error_file))]
    AllRowsFailed { error_file: Option<PathBuf> },

    #[error("Sort failed: {0}")]
    Sort(#[from] SortError),

    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("{} part(s) could not be uploaded: {}", .outstanding.len(), display_paths(.outstanding))]
    PartUpload { outstanding: Vec<PathBuf> },

    #[error("Missing access to remote entity types: {}", .missing.join(", "))]
    RemoteAccess { missing: Vec<String> },

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid dataset alias '{0}': must start with a letter, contain only letters, digits or '_', and be at most 50 characters")]
    InvalidAlias(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact checksum failed: {0}")]
    Checksum(#[from] edgeload_common::CommonError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn error_file_hint(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => "the log".to_string(),
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl LoaderError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
