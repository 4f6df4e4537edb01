//! Edgeload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pieces shared by every edgeload crate.
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: artifact fingerprints and `.sha256` sidecar files
//! - **Errors**: [`CommonError`] and the crate-wide [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use edgeload_common::checksum::{write_sidecar, verify_sidecar};
//!
//! fn seal(path: &std::path::Path) -> edgeload_common::Result<bool> {
//!     write_sidecar(path)?;
//!     verify_sidecar(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
