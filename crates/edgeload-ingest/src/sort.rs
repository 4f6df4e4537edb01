//! External merge sort for delimited files
//!
//! Rows are read as raw byte records, so nothing is decoded here: the key
//! column is compared byte-wise, which is deterministic for any ASCII
//! compatible charset. Charsets that are not ASCII compatible (UTF-16 and
//! friends) cannot be split on delimiter bytes and are refused.
//!
//! 1. **Accumulate**: read up to `buffer_rows` records into memory
//! 2. **Spill**: stable-sort the buffer by key and write it to a temp file
//! 3. **Merge**: k-way merge of the spilled chunks through a binary heap
//!
//! Equal keys keep their input order.

use crate::error::SortError;
use crate::schema::SortKey;
use csv::{ByteRecord, Reader, ReaderBuilder, Writer, WriterBuilder};
use encoding_rs::Encoding;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Rows held in memory before a chunk is spilled.
pub const DEFAULT_BUFFER_ROWS: usize = 100_000;

const MERGE_BUFFER_SIZE: usize = 64 * 1024;

pub struct ExternalSorter {
    buffer_rows: usize,
    temp_dir: Option<PathBuf>,
    delimiter: u8,
    quote: u8,
    encoding: &'static Encoding,
}

impl Default for ExternalSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalSorter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_rows: DEFAULT_BUFFER_ROWS,
            temp_dir: None,
            delimiter: b',',
            quote: b'"',
            encoding: encoding_rs::UTF_8,
        }
    }

    #[must_use]
    pub fn buffer_rows(mut self, rows: usize) -> Self {
        self.buffer_rows = rows.max(1);
        self
    }

    /// Directory the spill files are created under (system temp otherwise).
    #[must_use]
    pub fn temp_dir(mut self, path: PathBuf) -> Self {
        self.temp_dir = Some(path);
        self
    }

    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    #[must_use]
    pub fn quote(mut self, quote: u8) -> Self {
        self.quote = quote;
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sort `input` into `output` by `key`. The header row is copied
    /// unchanged.
    pub fn sort(&self, input: &Path, output: &Path, key: SortKey) -> Result<SortStats, SortError> {
        if !self.encoding.is_ascii_compatible() {
            return Err(SortError::UnsupportedCharset(self.encoding.name().to_string()));
        }

        info!(
            input = %input.display(),
            column = key.column,
            ascending = key.ascending,
            buffer_rows = self.buffer_rows,
            "Sorting input"
        );

        let mut reader = self.reader_builder(true).from_path(input)?;
        let header = reader.byte_headers()?.clone();

        let temp_dir = self.create_temp_dir()?;
        let mut stats = SortStats::default();
        let mut chunk_files: Vec<PathBuf> = Vec::new();
        let mut rows: Vec<ByteRecord> = Vec::with_capacity(self.buffer_rows.min(DEFAULT_BUFFER_ROWS));

        let mut record = ByteRecord::new();
        while reader.read_byte_record(&mut record)? {
            stats.total_records += 1;
            rows.push(record.clone());

            if rows.len() >= self.buffer_rows {
                let path = temp_dir.path().join(format!("chunk_{:04}", chunk_files.len()));
                self.write_chunk(&mut rows, &path, key)?;
                chunk_files.push(path);
                rows.clear();
            }
        }

        let mut writer = self.writer(output)?;
        writer.write_byte_record(&header)?;

        if chunk_files.is_empty() {
            debug!("All rows fit in memory");
            sort_rows(&mut rows, key);
            for row in &rows {
                writer.write_byte_record(row)?;
            }
        } else {
            if !rows.is_empty() {
                let path = temp_dir.path().join(format!("chunk_{:04}", chunk_files.len()));
                self.write_chunk(&mut rows, &path, key)?;
                chunk_files.push(path);
            }
            debug!(chunks = chunk_files.len(), "Merging spilled chunks");
            self.merge_chunks(&chunk_files, &mut writer, key)?;
        }

        writer.flush()?;
        stats.chunks_written = chunk_files.len();
        info!(
            rows = stats.total_records,
            chunks = stats.chunks_written,
            "Sort complete"
        );
        Ok(stats)
    }

    fn reader_builder(&self, has_headers: bool) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(has_headers)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote);
        builder
    }

    fn writer(&self, path: &Path) -> Result<Writer<BufWriter<File>>, SortError> {
        let file = File::create(path)?;
        Ok(WriterBuilder::new()
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .from_writer(BufWriter::new(file)))
    }

    fn write_chunk(&self, rows: &mut [ByteRecord], path: &Path, key: SortKey) -> Result<(), SortError> {
        sort_rows(rows, key);
        let mut writer = self.writer(path)?;
        for row in rows.iter() {
            writer.write_byte_record(row)?;
        }
        writer.flush()?;
        debug!(chunk = %path.display(), rows = rows.len(), "Spilled chunk");
        Ok(())
    }

    fn merge_chunks(
        &self,
        chunk_files: &[PathBuf],
        writer: &mut Writer<BufWriter<File>>,
        key: SortKey,
    ) -> Result<(), SortError> {
        let mut readers: Vec<Reader<BufReader<File>>> = chunk_files
            .iter()
            .map(|path| {
                let file = File::open(path)?;
                Ok(self
                    .reader_builder(false)
                    .from_reader(BufReader::with_capacity(MERGE_BUFFER_SIZE, file)))
            })
            .collect::<Result<Vec<_>, SortError>>()?;

        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some(entry) = next_entry(reader, idx, key)? {
                heap.push(Reverse(entry));
            }
        }

        while let Some(Reverse(entry)) = heap.pop() {
            writer.write_byte_record(&entry.record)?;
            if let Some(next) = next_entry(&mut readers[entry.chunk_idx], entry.chunk_idx, key)? {
                heap.push(Reverse(next));
            }
        }
        Ok(())
    }

    fn create_temp_dir(&self) -> Result<TempDir, SortError> {
        match &self.temp_dir {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(SortError::TempStorage)?;
                TempDir::new_in(base).map_err(SortError::TempStorage)
            },
            None => TempDir::new().map_err(SortError::TempStorage),
        }
    }
}

fn key_of(record: &ByteRecord, column: usize) -> &[u8] {
    record.get(column).unwrap_or_default()
}

fn compare_keys(a: &[u8], b: &[u8], ascending: bool) -> Ordering {
    if ascending {
        a.cmp(b)
    } else {
        b.cmp(a)
    }
}

fn sort_rows(rows: &mut [ByteRecord], key: SortKey) {
    rows.sort_by(|a, b| compare_keys(key_of(a, key.column), key_of(b, key.column), key.ascending));
}

fn next_entry(
    reader: &mut Reader<BufReader<File>>,
    chunk_idx: usize,
    key: SortKey,
) -> Result<Option<HeapEntry>, SortError> {
    let mut record = ByteRecord::new();
    if !reader.read_byte_record(&mut record)? {
        return Ok(None);
    }
    Ok(Some(HeapEntry {
        key: key_of(&record, key.column).to_vec(),
        ascending: key.ascending,
        record,
        chunk_idx,
    }))
}

/// Merge heap entry; ties go to the earlier chunk so equal keys stay in
/// input order.
struct HeapEntry {
    key: Vec<u8>,
    ascending: bool,
    record: ByteRecord,
    chunk_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.key, &other.key, self.ascending)
            .then_with(|| self.chunk_idx.cmp(&other.chunk_idx))
    }
}

/// Statistics from a sort run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SortStats {
    pub total_records: u64,
    /// Spill files written; zero when everything fit in memory
    pub chunks_written: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run(input: &str, sorter: ExternalSorter, key: SortKey) -> (String, SortStats) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.csv");
        let dst = dir.path().join("out.csv");
        std::fs::write(&src, input).unwrap();
        let stats = sorter.sort(&src, &dst, key).unwrap();
        (std::fs::read_to_string(&dst).unwrap(), stats)
    }

    const ASC: SortKey = SortKey { column: 0, ascending: true };

    #[test]
    fn test_in_memory_sort_keeps_header() {
        let (out, stats) = run("id,name\nc,3\na,1\nb,2\n", ExternalSorter::new(), ASC);
        assert_eq!(out, "id,name\na,1\nb,2\nc,3\n");
        assert_eq!(stats, SortStats { total_records: 3, chunks_written: 0 });
    }

    #[test]
    fn test_spilled_merge_matches_in_memory_sort() {
        let mut input = String::from("k,v\n");
        for i in [7, 3, 9, 1, 5, 8, 2, 6, 4, 0] {
            input.push_str(&format!("{i},row{i}\n"));
        }
        let (merged, stats) = run(&input, ExternalSorter::new().buffer_rows(3), ASC);
        let (memory, _) = run(&input, ExternalSorter::new(), ASC);
        assert_eq!(merged, memory);
        assert_eq!(stats.chunks_written, 4);
        assert!(merged.starts_with("k,v\n0,row0\n1,row1\n"));
    }

    #[test]
    fn test_descending_on_second_column_is_stable() {
        let input = "a,b\n1,x\n2,y\n3,x\n4,z\n5,y\n";
        let key = SortKey { column: 1, ascending: false };
        let (out, _) = run(input, ExternalSorter::new().buffer_rows(2), key);
        assert_eq!(out, "a,b\n4,z\n2,y\n5,y\n1,x\n3,x\n");
    }

    #[test]
    fn test_quoted_fields_survive() {
        let input = "id,note\n\"b\",\"has, comma\"\n\"a\",\"line\nbreak\"\n";
        let (out, _) = run(input, ExternalSorter::new().buffer_rows(1), ASC);
        assert_eq!(out, "id,note\na,\"line\nbreak\"\nb,\"has, comma\"\n");
    }

    #[test]
    fn test_custom_delimiter() {
        let (out, _) = run("x;y\n2;b\n1;a\n", ExternalSorter::new().delimiter(b';'), ASC);
        assert_eq!(out, "x;y\n1;a\n2;b\n");
    }

    #[test]
    fn test_rejects_utf16() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.csv");
        std::fs::write(&src, "a\n").unwrap();
        let err = ExternalSorter::new()
            .encoding(encoding_rs::UTF_16LE)
            .sort(&src, &dir.path().join("out.csv"), ASC)
            .unwrap_err();
        assert!(matches!(err, SortError::UnsupportedCharset(_)));
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = tempdir().unwrap();
        let result = ExternalSorter::new().sort(&dir.path().join("nope.csv"), &dir.path().join("o"), ASC);
        assert!(result.is_err());
    }
}
