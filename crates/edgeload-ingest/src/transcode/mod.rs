//! Row transcoder
//!
//! One blocking task reads the sorted input and pushes decoded rows into a
//! bounded channel; a second blocking task encodes them against the schema
//! and writes the gzip-wrapped artifact. The channel capacity bounds memory
//! and throttles the reader to the encoder. Rows keep input order because
//! there is exactly one producer and one consumer.
//!
//! Rows that fail to encode go to the [`ErrorSink`] and are counted. Bytes
//! that are not valid in the declared charset stop the reader; rows already
//! queued are still written before the failure is reported.

pub mod codec;
pub mod error_sink;

pub use codec::{BinaryWriter, CsvRecordWriter, RecordReader, RecordSink};
pub use error_sink::ErrorSink;

use crate::error::{LoaderError, Result};
use crate::schema::{DatasetSchema, FileFormat};
use crate::types::UploadFormat;
use csv::{ByteRecord, ReaderBuilder};
use encoding_rs::Encoding;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Span};

/// Rows in flight between reader and encoder.
pub const QUEUE_CAPACITY: usize = 10;

type ArtifactWriter = GzEncoder<BufWriter<File>>;

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub format: UploadFormat,
    pub encoding: &'static Encoding,
    pub queue_capacity: usize,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            format: UploadFormat::Binary,
            encoding: encoding_rs::UTF_8,
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeResult {
    pub total_row_count: u64,
    pub success_row_count: u64,
    pub error_row_count: u64,
    pub artifact: PathBuf,
    /// Present only when at least one row was rejected
    pub error_file: Option<PathBuf>,
}

struct Row {
    index: u64,
    cells: Vec<String>,
}

#[derive(Debug, Default)]
struct Counts {
    total: u64,
    success: u64,
    errors: u64,
    error_file: Option<PathBuf>,
}

/// Resolve a charset label such as `UTF-8`, `ISO-8859-1` or `windows-1252`.
pub fn resolve_charset(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

fn decode_cells(record: &ByteRecord, encoding: &'static Encoding) -> Option<Vec<String>> {
    record
        .iter()
        .map(|field| {
            encoding
                .decode_without_bom_handling_and_without_replacement(field)
                .map(|s| s.into_owned())
        })
        .collect()
}

fn reader_builder(format: &FileFormat) -> ReaderBuilder {
    let mut builder = ReaderBuilder::new();
    builder
        .has_headers(true)
        .flexible(true)
        .delimiter(format.delimiter())
        .quote(format.quote());
    builder
}

/// Read and decode just the header row. A leading byte order mark is dropped.
pub fn read_header(
    input: &Path,
    format: &FileFormat,
    encoding: &'static Encoding,
) -> Result<Vec<String>> {
    let mut reader = reader_builder(format)
        .from_path(input)
        .map_err(|e| LoaderError::Io(io::Error::from(e)))?;
    let header = reader
        .byte_headers()
        .map_err(|e| LoaderError::Io(io::Error::from(e)))?
        .clone();
    let mut cells = decode_cells(&header, encoding).ok_or_else(|| LoaderError::StreamEncoding {
        row: 0,
        charset: encoding.name().to_string(),
    })?;
    if let Some(first) = cells.first_mut() {
        if let Some(stripped) = first.strip_prefix('\u{feff}') {
            *first = stripped.to_string();
        }
    }
    Ok(cells)
}

/// Transcode `input` into the gzip-wrapped artifact at `output`. Rejected
/// rows go to `error_path`, which is only created when needed.
#[tracing::instrument(skip_all, fields(input = %input.display(), format = options.format.as_str()))]
pub async fn transcode(
    schema: Arc<DatasetSchema>,
    input: &Path,
    output: &Path,
    error_path: &Path,
    options: TranscodeOptions,
) -> Result<TranscodeResult> {
    let header = {
        let schema = schema.clone();
        let input = input.to_path_buf();
        let encoding = options.encoding;
        tokio::task::spawn_blocking(move || read_header(&input, schema.file_format(), encoding)).await??
    };
    let errors = ErrorSink::new(error_path, header);

    let file = File::create(output)?;
    let gz = GzEncoder::new(BufWriter::new(file), Compression::default());

    let (tx, rx) = mpsc::channel::<Row>(options.queue_capacity.max(1));

    let producer = tokio::task::spawn_blocking({
        let schema = schema.clone();
        let input = input.to_path_buf();
        let encoding = options.encoding;
        let span = Span::current();
        move || {
            let _entered = span.enter();
            produce(&schema, &input, encoding, tx)
        }
    });

    let consumer = match options.format {
        UploadFormat::Binary => {
            let sink = BinaryWriter::new(gz, &schema)?;
            spawn_consumer(schema.clone(), sink, errors, rx)
        },
        UploadFormat::Csv => {
            let sink = CsvRecordWriter::new(gz, &schema)?;
            spawn_consumer(schema.clone(), sink, errors, rx)
        },
    };

    // Both tasks always run to completion: a reader failure closes the
    // channel and the consumer drains what is left before finishing.
    let (produced, consumed) = tokio::join!(producer, consumer);
    let counts = consumed??;
    let rows_read = produced??;

    if rows_read != counts.total {
        warn!(rows_read, rows_encoded = counts.total, "Reader and encoder disagree on row count");
    }

    info!(
        total = counts.total,
        success = counts.success,
        errors = counts.errors,
        "Transcode complete"
    );

    Ok(TranscodeResult {
        total_row_count: counts.total,
        success_row_count: counts.success,
        error_row_count: counts.errors,
        artifact: output.to_path_buf(),
        error_file: counts.error_file,
    })
}

/// Reader side. Returns the number of rows handed to the consumer.
fn produce(
    schema: &DatasetSchema,
    input: &Path,
    encoding: &'static Encoding,
    tx: mpsc::Sender<Row>,
) -> Result<u64> {
    let mut reader = reader_builder(schema.file_format())
        .from_path(input)
        .map_err(|e| LoaderError::Io(io::Error::from(e)))?;

    let mut record = ByteRecord::new();
    let mut index = 0u64;
    let mut sent = 0u64;
    while reader
        .read_byte_record(&mut record)
        .map_err(|e| LoaderError::Io(io::Error::from(e)))?
    {
        index += 1;
        if record.iter().all(<[u8]>::is_empty) {
            debug!(row = index, "Skipping empty row");
            continue;
        }

        let Some(cells) = decode_cells(&record, encoding) else {
            warn!(row = index, charset = encoding.name(), "Row is not valid in the declared charset");
            return Err(LoaderError::StreamEncoding {
                row: index,
                charset: encoding.name().to_string(),
            });
        };

        if tx.blocking_send(Row { index, cells }).is_err() {
            debug!("Encoder stopped early, reader exiting");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn spawn_consumer<S>(
    schema: Arc<DatasetSchema>,
    sink: S,
    errors: ErrorSink,
    rx: mpsc::Receiver<Row>,
) -> tokio::task::JoinHandle<Result<Counts>>
where
    S: RecordSink<ArtifactWriter> + Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        consume(&schema, sink, errors, rx)
    })
}

/// Encoder side. Owns the authoritative counts.
fn consume<S: RecordSink<ArtifactWriter>>(
    schema: &DatasetSchema,
    mut sink: S,
    mut errors: ErrorSink,
    mut rx: mpsc::Receiver<Row>,
) -> Result<Counts> {
    let mut counts = Counts::default();

    while let Some(row) = rx.blocking_recv() {
        counts.total += 1;
        match schema.encode_row(&row.cells) {
            Ok(values) => {
                sink.write_record(&values)?;
                counts.success += 1;
            },
            Err(e) => {
                debug!(row = row.index, reason = %e, "Row rejected");
                errors.record(row.index, &e.to_string(), &row.cells)?;
                counts.errors += 1;
            },
        }
    }

    let mut out = sink.finish()?.finish()?;
    out.flush()?;
    counts.error_file = errors.finish()?;
    Ok(counts)
}
