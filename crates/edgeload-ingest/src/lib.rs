//! Edgeload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads delimited files into a remote analytics dataset.
//!
//! # Pipeline
//!
//! - **Schema**: typed field definitions, loaded from a `<stem>_schema.json`
//!   sidecar or derived from the header row
//! - **Sort**: external merge sort on the schema's sort column
//! - **Transcode**: rows are validated and encoded into a gzip-wrapped
//!   artifact; rejected rows land in an error file
//! - **Chunk**: the artifact is split into numbered parts
//! - **Upload**: parts are sent one by one or as zipped async batches, with
//!   bounded retries, and the job is finalized once all are confirmed
//!
//! Every step is resumable: uploaded part numbers are read back from the
//! remote side and a sealed artifact in the archive skips the digest.
//!
//! # Example
//!
//! ```no_run
//! use edgeload_ingest::{LoadRequest, LoaderConfig, MemoryRemote, Pipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::new(Arc::new(MemoryRemote::new()), LoaderConfig::from_env()?);
//!     let outcome = pipeline.run(&LoadRequest::new("./data/orders.csv").alias("orders")).await?;
//!     println!("{} rows loaded", outcome.success_row_count);
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod remote;
pub mod schema;
pub mod sort;
pub mod transcode;
pub mod types;
pub mod upload;

pub use chunk::Chunker;
pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use job::JobStateTracker;
pub use pipeline::{LoadOutcome, LoadRequest, Pipeline};
pub use remote::{HttpRemote, MemoryRemote, RemoteService};
pub use schema::DatasetSchema;
pub use sort::ExternalSorter;
pub use types::{FilePart, Operation, UploadFormat, UploadMode};
pub use upload::{PartUploadCoordinator, UploadConfig, UploadOutcome};
