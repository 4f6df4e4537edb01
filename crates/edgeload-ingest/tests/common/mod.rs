//! Shared fixtures for the integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use edgeload_ingest::types::FilePart;
use edgeload_ingest::upload::RecordingSleeper;
use edgeload_ingest::{LoadRequest, LoaderConfig, MemoryRemote, Pipeline, UploadMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Schema for `id,amount,date` with a two-decimal amount.
pub const SALES_SCHEMA: &str = r#"{
  "fileFormat": {
    "charsetName": "UTF-8",
    "fieldsDelimitedBy": ",",
    "fieldsEnclosedBy": "\"",
    "numberOfLinesToIgnore": 1
  },
  "objects": [
    {
      "connector": "CSV",
      "name": "sales",
      "fields": [
        { "name": "id", "type": "Text" },
        { "name": "amount", "type": "Numeric", "precision": 18, "scale": 2 },
        { "name": "date", "type": "Date", "format": "yyyy-MM-dd" }
      ]
    }
  ]
}"#;

/// Write `sales.csv` with `body` and its schema sidecar into `dir`.
pub fn write_sales(dir: &Path, body: &[u8]) -> PathBuf {
    let input = dir.join("sales.csv");
    std::fs::write(&input, body).unwrap();
    std::fs::write(dir.join("sales_schema.json"), SALES_SCHEMA).unwrap();
    input
}

/// One valid row and one with an unparsable amount.
pub fn write_mixed_sales(dir: &Path) -> PathBuf {
    write_sales(dir, b"id,amount,date\n1,10.5,2024-01-01\n2,bad,2024-01-02\n")
}

/// Enough valid rows to produce several parts with a small chunk size.
pub fn write_many_sales(dir: &Path, rows: usize) -> PathBuf {
    let mut body = String::from("id,amount,date\n");
    for i in 0..rows {
        body.push_str(&format!("{i},{}.{:02},2024-01-{:02}\n", i * 7, i % 100, i % 28 + 1));
    }
    write_sales(dir, body.as_bytes())
}

pub fn config(archive_dir: &Path, chunk_size: usize) -> LoaderConfig {
    LoaderConfig {
        archive_dir: archive_dir.to_path_buf(),
        chunk_size,
        ..Default::default()
    }
}

pub fn pipeline(remote: Arc<MemoryRemote>, config: LoaderConfig) -> (Pipeline, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    (Pipeline::new(remote, config).with_sleeper(sleeper.clone()), sleeper)
}

pub fn request(input: &Path, alias: &str, mode: UploadMode) -> LoadRequest {
    LoadRequest {
        mode,
        ..LoadRequest::new(input).alias(alias)
    }
}

/// Write `count` part files holding `part-<n>` and return them pending.
pub fn write_parts(dir: &Path, count: u32) -> Vec<FilePart> {
    (1..=count)
        .map(|n| {
            let path = dir.join(format!("06V.sales.gz.{n}"));
            std::fs::write(&path, format!("part-{n}")).unwrap();
            FilePart::pending(n, path)
        })
        .collect()
}

/// Files directly inside `dir` whose name ends with `suffix`.
pub fn files_ending(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect();
    found.sort();
    found
}
