//! Rejected-row file
//!
//! The file is only created once the first row is rejected, so a clean run
//! leaves nothing behind. Each line is `row_index,reason,<raw cells...>`
//! where `row_index` counts data rows from 1.

use csv::{Writer, WriterBuilder};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

pub struct ErrorSink {
    path: PathBuf,
    header: Vec<String>,
    writer: Option<Writer<BufWriter<File>>>,
    count: u64,
}

impl ErrorSink {
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        Self {
            path: path.into(),
            header,
            writer: None,
            count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn writer(&mut self) -> io::Result<&mut Writer<BufWriter<File>>> {
        if self.writer.is_none() {
            let file = File::create(&self.path)?;
            let mut writer = WriterBuilder::new()
                .flexible(true)
                .from_writer(BufWriter::new(file));
            let mut header = vec!["row_index".to_string(), "reason".to_string()];
            header.extend(self.header.iter().cloned());
            writer.write_record(&header).map_err(io::Error::from)?;
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("error sink writer missing"))
    }

    pub fn record(&mut self, row_index: u64, reason: &str, raw: &[String]) -> io::Result<()> {
        let writer = self.writer()?;
        let mut line = Vec::with_capacity(raw.len() + 2);
        line.push(row_index.to_string());
        line.push(reason.to_string());
        line.extend(raw.iter().cloned());
        writer.write_record(&line).map_err(io::Error::from)?;
        self.count += 1;
        Ok(())
    }

    /// Flush and return the file path when at least one row was rejected.
    pub fn finish(self) -> io::Result<Option<PathBuf>> {
        match self.writer {
            Some(mut writer) => {
                writer.flush()?;
                Ok(Some(self.path))
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_no_rejects_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("err.csv");
        let sink = ErrorSink::new(&path, vec!["a".into()]);
        assert_eq!(sink.finish().unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_are_written_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("err.csv");
        let mut sink = ErrorSink::new(&path, vec!["id".into(), "amount".into()]);
        sink.record(2, "field 'amount': value 'bad' is not a valid number", &["2".into(), "bad".into()])
            .unwrap();
        sink.record(5, "field 'row': expected 2 columns, found 1", &["9".into()]).unwrap();
        assert_eq!(sink.count(), 2);

        let written = sink.finish().unwrap().unwrap();
        let content = std::fs::read_to_string(written).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "row_index,reason,id,amount");
        assert_eq!(lines[1], "2,field 'amount': value 'bad' is not a valid number,2,bad");
        assert_eq!(lines[2], "5,\"field 'row': expected 2 columns, found 1\",9");
    }
}
