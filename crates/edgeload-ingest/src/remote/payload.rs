//! Zipped batch payloads
//!
//! A batch carries one part: `request.txt` names the job, the part number
//! and the attached file, and the file itself sits next to it in the archive.

use crate::error::RemoteError;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "request.txt";

const MANIFEST_HEADER: &str = "InsightsExternalDataId,PartNumber,DataFile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPayload {
    pub job_id: String,
    pub part_number: u32,
    pub file_name: String,
    pub data: Vec<u8>,
}

impl BatchPayload {
    pub fn manifest(&self) -> String {
        format!(
            "{MANIFEST_HEADER}\n{},{},#{}\n",
            self.job_id, self.part_number, self.file_name
        )
    }

    /// Build the zip archive. Parts are already compressed, so entries are
    /// stored as-is.
    pub fn to_zip(&self) -> Result<Vec<u8>, RemoteError> {
        let zip_err = |e: zip::result::ZipError| RemoteError::rejected(format!("building batch zip: {e}"));
        let io_err = |e: std::io::Error| RemoteError::rejected(format!("building batch zip: {e}"));

        let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(self.data.len() + 512)));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        writer.start_file(MANIFEST_NAME, options).map_err(zip_err)?;
        writer.write_all(self.manifest().as_bytes()).map_err(io_err)?;
        writer.start_file(self.file_name.as_str(), options).map_err(zip_err)?;
        writer.write_all(&self.data).map_err(io_err)?;

        Ok(writer.finish().map_err(zip_err)?.into_inner())
    }

    /// Parse an archive built by [`BatchPayload::to_zip`].
    pub fn from_zip(bytes: &[u8]) -> Result<Self, RemoteError> {
        let bad = |msg: String| RemoteError::rejected(format!("malformed batch: {msg}"));

        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| bad(e.to_string()))?;
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_NAME)
            .map_err(|e| bad(e.to_string()))?
            .read_to_string(&mut manifest)
            .map_err(|e| bad(e.to_string()))?;

        let mut lines = manifest.lines();
        if lines.next() != Some(MANIFEST_HEADER) {
            return Err(bad("unexpected manifest header".to_string()));
        }
        let row = lines.next().ok_or_else(|| bad("manifest has no row".to_string()))?;
        let mut cells = row.splitn(3, ',');
        let (Some(job_id), Some(part), Some(file)) = (cells.next(), cells.next(), cells.next()) else {
            return Err(bad(format!("manifest row '{row}'")));
        };
        let part_number = part
            .trim()
            .parse::<u32>()
            .map_err(|_| bad(format!("part number '{part}'")))?;
        let file_name = file.trim_start_matches('#').to_string();

        let mut data = Vec::new();
        archive
            .by_name(&file_name)
            .map_err(|e| bad(format!("{file_name}: {e}")))?
            .read_to_end(&mut data)
            .map_err(|e| bad(e.to_string()))?;

        Ok(Self {
            job_id: job_id.to_string(),
            part_number,
            file_name,
            data,
        })
    }
}
