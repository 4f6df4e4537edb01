// Dataset load pipeline
//
// Orchestrates one load of a delimited file into a remote dataset:
// 1. Validate the alias and prepare the schema (load the sidecar or derive it)
// 2. Check remote access and resume or create the job
// 3. Digest: sort, transcode and seal the artifact (skipped when a sealed
//    artifact from an earlier run is still in the archive). Inputs without a
//    `.csv` extension are already encoded and are only gzipped and sealed.
// 4. Split the artifact into parts and upload them
// 5. Finalize the job once every part is confirmed

use crate::chunk::Chunker;
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::job::JobStateTracker;
use crate::remote::{JobHeader, RemoteService};
use crate::schema::{is_identifier, sanitize_name, DatasetSchema, FileFormat};
use crate::sort::ExternalSorter;
use crate::transcode::{self, read_header, resolve_charset, TranscodeOptions};
use crate::types::{JobAction, Operation, UploadFormat, UploadMode};
use crate::upload::{PartUploadCoordinator, Sleeper, UploadOutcome};
use edgeload_common::checksum::{remove_with_sidecar, verify_sidecar, write_sidecar};
use encoding_rs::Encoding;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};

/// Longest accepted dataset alias.
pub const MAX_ALIAS_LENGTH: usize = 50;

/// What to load and how.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub input: PathBuf,
    /// Target dataset. `None` only prepares the schema.
    pub alias: Option<String>,
    pub folder: Option<String>,
    pub label: Option<String>,
    pub format: UploadFormat,
    /// Overrides the charset stored in the schema
    pub charset: Option<String>,
    pub operation: Operation,
    pub mode: UploadMode,
}

impl LoadRequest {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            alias: None,
            folder: None,
            label: None,
            format: UploadFormat::default(),
            charset: None,
            operation: Operation::default(),
            mode: UploadMode::default(),
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Result of a load. `success` is false only when parts are left over.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub success: bool,
    pub schema_path: PathBuf,
    pub job_id: Option<String>,
    pub resumed: bool,
    pub digest_skipped: bool,
    pub total_row_count: u64,
    pub success_row_count: u64,
    pub error_row_count: u64,
    pub error_file: Option<PathBuf>,
    pub artifact: Option<PathBuf>,
    pub upload: Option<UploadOutcome>,
    pub digest_duration: Duration,
    pub upload_duration: Duration,
}

impl LoadOutcome {
    fn schema_only(schema_path: PathBuf) -> Self {
        Self {
            success: true,
            schema_path,
            job_id: None,
            resumed: false,
            digest_skipped: false,
            total_row_count: 0,
            success_row_count: 0,
            error_row_count: 0,
            error_file: None,
            artifact: None,
            upload: None,
            digest_duration: Duration::ZERO,
            upload_duration: Duration::ZERO,
        }
    }

    /// Turn an unsuccessful outcome into [`LoaderError::PartUpload`].
    pub fn ensure_success(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let outstanding = self.upload.map(|u| u.outstanding).unwrap_or_default();
        Err(LoaderError::PartUpload { outstanding })
    }
}

/// Row counts kept next to a sealed artifact so a resumed run can report
/// them without digesting again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DigestManifest {
    total_row_count: u64,
    success_row_count: u64,
    error_row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_file: Option<PathBuf>,
}

/// Reject aliases the remote side would not accept.
pub fn validate_alias(alias: &str) -> Result<()> {
    if is_identifier(alias, MAX_ALIAS_LENGTH) {
        Ok(())
    } else {
        Err(LoaderError::InvalidAlias(alias.to_string()))
    }
}

fn file_stem(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// `<dir>/<stem>_schema.json` next to the input.
pub fn schema_path_for(input: &Path) -> PathBuf {
    input.with_file_name(format!("{}_schema.json", file_stem(input)))
}

/// `<dir>/<stem>_errors.csv` next to the input.
pub fn error_path_for(input: &Path) -> PathBuf {
    input.with_file_name(format!("{}_errors.csv", file_stem(input)))
}

fn has_extension(input: &Path, ext: &str) -> bool {
    input.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Anything but a `.csv` file is taken as an already encoded artifact.
pub fn is_pre_encoded(input: &Path) -> bool {
    !has_extension(input, "csv")
}

fn encoding_for(label: &str) -> Result<&'static Encoding> {
    resolve_charset(label).ok_or_else(|| LoaderError::Config(format!("unknown charset '{label}'")))
}

/// Load the schema sidecar of `input`, or derive one from the header row
/// and write it. Returns the schema, its persisted bytes and its path.
pub async fn prepare_schema(
    input: &Path,
    name: Option<&str>,
    charset: Option<&str>,
) -> Result<(DatasetSchema, Vec<u8>, PathBuf)> {
    let schema_path = schema_path_for(input);

    if tokio::fs::try_exists(&schema_path).await? {
        let bytes = tokio::fs::read(&schema_path).await?;
        let schema = DatasetSchema::load(&bytes)?;
        info!(path = %schema_path.display(), fields = schema.fields().len(), "Loaded schema");
        return Ok((schema, bytes, schema_path));
    }

    let charset = charset.unwrap_or("UTF-8").to_string();
    let encoding = encoding_for(&charset)?;
    let format = FileFormat {
        charset_name: charset,
        ..Default::default()
    };
    let header = {
        let input = input.to_path_buf();
        let format = format.clone();
        tokio::task::spawn_blocking(move || read_header(&input, &format, encoding)).await??
    };

    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| sanitize_name(&file_stem(input), 0));
    let schema = DatasetSchema::derive_from_header(&name, &header)?.with_file_format(format);
    let bytes = schema.to_json_bytes()?;
    tokio::fs::write(&schema_path, &bytes).await?;
    info!(path = %schema_path.display(), fields = schema.fields().len(), "Derived schema from header");
    Ok((schema, bytes, schema_path))
}

pub struct Pipeline {
    tracker: JobStateTracker,
    config: LoaderConfig,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl Pipeline {
    pub fn new(remote: Arc<dyn RemoteService>, config: LoaderConfig) -> Self {
        Self {
            tracker: JobStateTracker::new(remote),
            config,
            sleeper: None,
        }
    }

    /// Replace the sleeper used between upload rounds and status polls.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Run one load. Fatal problems are errors; parts left unconfirmed after
    /// every retry give an outcome with `success == false`.
    ///
    /// The job is opened before the digest. When the digest fails the job
    /// stays open with no parts and the next run for the alias resumes it.
    pub async fn run(&self, request: &LoadRequest) -> Result<LoadOutcome> {
        // Step 1: alias and schema
        if let Some(alias) = &request.alias {
            validate_alias(alias)?;
        }
        let pre_encoded = is_pre_encoded(&request.input);
        if pre_encoded && !tokio::fs::try_exists(schema_path_for(&request.input)).await? {
            return Err(LoaderError::Config(format!(
                "'{}' is not a .csv file and is uploaded as encoded, which needs the schema file '{}'",
                request.input.display(),
                schema_path_for(&request.input).display()
            )));
        }
        let (schema, schema_bytes, schema_path) =
            prepare_schema(&request.input, request.alias.as_deref(), request.charset.as_deref()).await?;

        let Some(alias) = request.alias.as_deref() else {
            info!(path = %schema_path.display(), "No alias given, schema prepared only");
            return Ok(LoadOutcome::schema_only(schema_path));
        };

        // Step 2: remote job
        self.tracker.check_access().await?;

        let archive_dir = self.config.archive_dir.join(alias);
        tokio::fs::create_dir_all(&archive_dir).await?;

        let (job_id, resumed) = match self.tracker.find_resumable_job(alias).await? {
            Some(job) => {
                info!(job_id = %job.id, alias, "Resuming incomplete job");
                (job.id, true)
            },
            None => {
                let id = self
                    .tracker
                    .create_job(JobHeader {
                        alias: alias.to_string(),
                        folder: request.folder.clone(),
                        label: request.label.clone(),
                        format: request.format,
                        operation: request.operation,
                        metadata: schema_bytes,
                        action: JobAction::None,
                    })
                    .await?;
                (id, false)
            },
        };

        // Step 3: digest
        let digest_start = Instant::now();
        let stem = file_stem(&request.input);
        let artifact = archive_dir.join(format!("{job_id}.{stem}.gz"));
        let manifest_path = archive_dir.join(format!("{job_id}.{stem}.digest.json"));

        let (manifest, digest_skipped) = if sealed(&artifact).await? {
            info!(artifact = %artifact.display(), "Sealed artifact found, skipping digest");
            (read_manifest(&manifest_path).await, true)
        } else {
            let digested = if pre_encoded {
                seal_encoded(&request.input, &artifact)
                    .instrument(info_span!("seal", job_id = %job_id))
                    .await
            } else {
                self.digest(request, Arc::new(schema), &artifact)
                    .instrument(info_span!("digest", job_id = %job_id))
                    .await
            };
            let manifest = match digested {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(job_id = %job_id, alias, error = %e, "Digest failed, job stays open for the next run");
                    return Err(e);
                },
            };
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| LoaderError::Io(std::io::Error::other(e)))?;
            tokio::fs::write(&manifest_path, bytes).await?;
            (manifest, false)
        };
        let digest_duration = digest_start.elapsed();

        // Step 4: chunk and upload
        let upload_start = Instant::now();
        let chunker = Chunker::new(self.config.chunk_config().chunk_size);
        let parts = {
            let artifact = artifact.clone();
            let archive_dir = archive_dir.clone();
            let span = info_span!("chunk", job_id = %job_id);
            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                chunker.chunk_parts(&artifact, &archive_dir)
            })
            .await??
        };

        let mut coordinator =
            PartUploadCoordinator::new(self.tracker.clone(), self.config.upload_config(request.mode));
        if let Some(sleeper) = &self.sleeper {
            coordinator = coordinator.with_sleeper(sleeper.clone());
        }
        let upload = coordinator.upload(&job_id, parts).await?;

        // Step 5: finalize
        let success = upload.is_complete();
        if success {
            self.tracker.finalize(&job_id).await?;
        }
        let upload_duration = upload_start.elapsed();

        let outcome = LoadOutcome {
            success,
            schema_path,
            job_id: Some(job_id),
            resumed,
            digest_skipped,
            total_row_count: manifest.total_row_count,
            success_row_count: manifest.success_row_count,
            error_row_count: manifest.error_row_count,
            error_file: manifest.error_file,
            artifact: Some(artifact),
            upload: Some(upload),
            digest_duration,
            upload_duration,
        };
        log_summary(&request.input, &outcome).await;
        Ok(outcome)
    }

    /// Sort and transcode the input into `artifact`, then seal it with a
    /// checksum sidecar. Nothing is left at `artifact` unless every step
    /// succeeds.
    async fn digest(
        &self,
        request: &LoadRequest,
        schema: Arc<DatasetSchema>,
        artifact: &Path,
    ) -> Result<DigestManifest> {
        let charset = request
            .charset
            .clone()
            .unwrap_or_else(|| schema.file_format().charset_name.clone());
        let encoding = encoding_for(&charset)?;

        let scratch = tempfile::Builder::new().prefix("edgeload-").tempdir()?;
        let source = if has_sort_field(&schema) {
            let sorted = scratch.path().join("sorted.csv");
            let sorter = ExternalSorter::new()
                .buffer_rows(self.config.sort_config().buffer_rows)
                .temp_dir(scratch.path().to_path_buf())
                .delimiter(schema.file_format().delimiter())
                .quote(schema.file_format().quote())
                .encoding(encoding);
            let key = schema.sort_key();
            let input = request.input.clone();
            let output = sorted.clone();
            let span = info_span!("sort", buffer_rows = self.config.sort_config().buffer_rows);
            let stats = tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                sorter.sort(&input, &output, key)
            })
            .await??;
            info!(rows = stats.total_records, chunks = stats.chunks_written, "Input sorted");
            sorted
        } else {
            request.input.clone()
        };

        let partial = artifact.with_extension("gz.partial");
        let error_path = error_path_for(&request.input);
        let options = TranscodeOptions {
            format: request.format,
            encoding,
            ..Default::default()
        };
        let result = match transcode::transcode(schema, &source, &partial, &error_path, options).await {
            Ok(result) => result,
            Err(e) => {
                discard(&partial).await;
                return Err(e);
            },
        };

        if result.success_row_count == 0 {
            discard(&partial).await;
            return Err(LoaderError::AllRowsFailed {
                error_file: result.error_file,
            });
        }

        tokio::fs::rename(&partial, artifact).await?;
        let sealed = artifact.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || write_sidecar(&sealed)).await??;
        info!(artifact = %artifact.display(), sha256 = %digest, "Artifact sealed");

        Ok(DigestManifest {
            total_row_count: result.total_row_count,
            success_row_count: result.success_row_count,
            error_row_count: result.error_row_count,
            error_file: result.error_file,
        })
    }
}

/// Gzip `input` into `artifact` (or copy it when it is already compressed)
/// and seal it. Row counts of an encoded input are not known.
async fn seal_encoded(input: &Path, artifact: &Path) -> Result<DigestManifest> {
    let partial = artifact.with_extension("gz.partial");
    let written = if has_extension(input, "gz") || has_extension(input, "zip") {
        tokio::fs::copy(input, &partial).await.map(|_| ())
    } else {
        let (source, target) = (input.to_path_buf(), partial.clone());
        tokio::task::spawn_blocking(move || gzip_file(&source, &target)).await?
    };
    if let Err(e) = written {
        discard(&partial).await;
        return Err(e.into());
    }

    tokio::fs::rename(&partial, artifact).await?;
    let sealed = artifact.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || write_sidecar(&sealed)).await??;
    info!(input = %input.display(), artifact = %artifact.display(), sha256 = %digest, "Encoded input sealed");
    Ok(DigestManifest::default())
}

fn gzip_file(input: &Path, output: &Path) -> std::io::Result<()> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut gz = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::default());
    std::io::copy(&mut reader, &mut gz)?;
    gz.finish()?.flush()
}

fn has_sort_field(schema: &DatasetSchema) -> bool {
    schema.fields().iter().any(|f| !f.is_computed() && f.sort().0 > 0)
}

/// True when `artifact` exists and matches its sidecar. A stale artifact is
/// removed so it gets digested again.
async fn sealed(artifact: &Path) -> Result<bool> {
    if !tokio::fs::try_exists(artifact).await? {
        return Ok(false);
    }
    let path = artifact.to_path_buf();
    let verified = tokio::task::spawn_blocking(move || verify_sidecar(&path)).await??;
    if !verified {
        warn!(artifact = %artifact.display(), "Artifact does not match its checksum, digesting again");
        let path = artifact.to_path_buf();
        tokio::task::spawn_blocking(move || remove_with_sidecar(&path)).await??;
    }
    Ok(verified)
}

async fn read_manifest(path: &Path) -> DigestManifest {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Unreadable digest manifest, row counts unknown");
            DigestManifest::default()
        }),
        Err(_) => DigestManifest::default(),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove partial artifact");
        }
    }
}

async fn log_summary(input: &Path, outcome: &LoadOutcome) {
    let input_size = tokio::fs::metadata(input).await.map(|m| m.len()).unwrap_or(0);
    let artifact_size = match &outcome.artifact {
        Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
        None => 0,
    };
    let compression_ratio = if artifact_size > 0 {
        input_size as f64 / artifact_size as f64
    } else {
        0.0
    };

    info!(
        job_id = outcome.job_id.as_deref().unwrap_or(""),
        success = outcome.success,
        total = outcome.total_row_count,
        succeeded = outcome.success_row_count,
        errors = outcome.error_row_count,
        error_file = %outcome.error_file.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        digest_secs = outcome.digest_duration.as_secs_f64(),
        upload_secs = outcome.upload_duration.as_secs_f64(),
        compression_ratio,
        "Load finished"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_alias_rules() {
        assert!(validate_alias("Sales_2024").is_ok());
        assert!(validate_alias(&"a".repeat(50)).is_ok());
        assert!(matches!(validate_alias(&"a".repeat(51)), Err(LoaderError::InvalidAlias(_))));
        assert!(validate_alias("2024sales").is_err());
        assert!(validate_alias("sales-data").is_err());
        assert!(validate_alias("").is_err());
    }

    #[test]
    fn test_sidecar_paths() {
        let input = Path::new("/data/in/orders.2024.csv");
        assert_eq!(schema_path_for(input), Path::new("/data/in/orders.2024_schema.json"));
        assert_eq!(error_path_for(input), Path::new("/data/in/orders.2024_errors.csv"));
    }

    #[test]
    fn test_only_csv_inputs_are_transcoded() {
        assert!(!is_pre_encoded(Path::new("orders.csv")));
        assert!(!is_pre_encoded(Path::new("ORDERS.CSV")));
        assert!(is_pre_encoded(Path::new("orders.ebin")));
        assert!(is_pre_encoded(Path::new("orders.csv.gz")));
        assert!(is_pre_encoded(Path::new("orders")));
    }

    #[tokio::test]
    async fn test_prepare_schema_derives_then_reloads() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("orders.csv");
        std::fs::write(&input, "\u{feff}Order Id,amount,2nd\n1,2,3\n").unwrap();

        let (schema, bytes, path) = prepare_schema(&input, Some("orders"), None).await.unwrap();
        assert_eq!(path, dir.path().join("orders_schema.json"));
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, ["Order_Id", "amount", "X2nd"]);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        // the sidecar now wins over the header
        std::fs::write(&input, "other,columns\n1,2\n").unwrap();
        let (reloaded, _, _) = prepare_schema(&input, Some("orders"), None).await.unwrap();
        assert_eq!(reloaded.fields().len(), 3);
    }

    #[tokio::test]
    async fn test_sealed_discards_tampered_artifact() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("06V.orders.gz");
        assert!(!sealed(&artifact).await.unwrap());

        std::fs::write(&artifact, b"payload").unwrap();
        write_sidecar(&artifact).unwrap();
        assert!(sealed(&artifact).await.unwrap());

        std::fs::write(&artifact, b"tampered").unwrap();
        assert!(!sealed(&artifact).await.unwrap());
        assert!(!artifact.exists());
    }

    #[test]
    fn test_unsuccessful_outcome_names_outstanding_parts() {
        let mut outcome = LoadOutcome::schema_only(PathBuf::from("s.json"));
        outcome.success = false;
        outcome.upload = Some(UploadOutcome {
            rounds: 3,
            uploaded: vec![1],
            outstanding: vec![PathBuf::from("archive/sales/06V.orders.gz.2")],
        });
        match outcome.ensure_success() {
            Err(LoaderError::PartUpload { outstanding }) => {
                assert_eq!(outstanding, [PathBuf::from("archive/sales/06V.orders.gz.2")])
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
