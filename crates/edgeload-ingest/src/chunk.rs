//! Fixed-size artifact splitting
//!
//! Parts are written next to each other in the archive directory as
//! `<artifact name>.<n>`, numbered from 1 without gaps. The split depends only
//! on the artifact bytes and the chunk size, so a re-run over the same
//! artifact reproduces the same numbering.

use crate::error::ChunkError;
use crate::types::FilePart;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 8 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Path of part `part_number` for `artifact` inside `archive_dir`.
    pub fn part_path(artifact: &Path, archive_dir: &Path, part_number: u32) -> PathBuf {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        archive_dir.join(format!("{name}.{part_number}"))
    }

    /// Split `artifact` into parts under `archive_dir`.
    pub fn chunk(&self, artifact: &Path, archive_dir: &Path) -> Result<BTreeMap<u32, PathBuf>, ChunkError> {
        let unreadable = |source| ChunkError::Unreadable {
            path: artifact.to_path_buf(),
            source,
        };

        let file = File::open(artifact).map_err(unreadable)?;
        let size = file.metadata().map_err(unreadable)?.len();
        if size == 0 {
            return Err(ChunkError::Empty(artifact.to_path_buf()));
        }

        info!(
            artifact = %artifact.display(),
            size,
            chunk_size = self.chunk_size,
            "Splitting artifact into parts"
        );

        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; self.chunk_size];
        let mut parts = BTreeMap::new();
        let mut part_number = 0u32;

        loop {
            let filled = fill(&mut reader, &mut buf).map_err(unreadable)?;
            if filled == 0 {
                break;
            }
            part_number += 1;
            let path = Self::part_path(artifact, archive_dir, part_number);
            write_part(&path, &buf[..filled])?;
            debug!(part = part_number, bytes = filled, "Wrote part");
            parts.insert(part_number, path);
            if filled < buf.len() {
                break;
            }
        }

        info!(parts = parts.len(), "Artifact split");
        Ok(parts)
    }

    /// Like [`Chunker::chunk`] but returns pending [`FilePart`]s in order.
    pub fn chunk_parts(&self, artifact: &Path, archive_dir: &Path) -> Result<Vec<FilePart>, ChunkError> {
        Ok(self
            .chunk(artifact, archive_dir)?
            .into_iter()
            .map(|(n, path)| FilePart::pending(n, path))
            .collect())
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_part(path: &Path, bytes: &[u8]) -> Result<(), ChunkError> {
    let write_err = |source| ChunkError::Write {
        path: path.to_path_buf(),
        source,
    };
    if path.exists() {
        std::fs::remove_file(path).map_err(write_err)?;
    }
    let mut file = File::create(path).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.flush().map_err(write_err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_parts_are_numbered_from_one() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("job.sales.gz");
        std::fs::write(&artifact, vec![7u8; 25]).unwrap();

        let parts = Chunker::new(10).chunk(&artifact, dir.path()).unwrap();
        assert_eq!(parts.keys().copied().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(parts[&1], dir.path().join("job.sales.gz.1"));
        assert_eq!(std::fs::metadata(&parts[&3]).unwrap().len(), 5);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.gz");
        std::fs::write(&artifact, vec![1u8; 20]).unwrap();
        let parts = Chunker::new(10).chunk(&artifact, dir.path()).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(!dir.path().join("a.gz.3").exists());
    }

    #[test]
    fn test_rechunk_replaces_stale_parts() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.gz");
        std::fs::write(&artifact, b"abcdef").unwrap();
        std::fs::write(dir.path().join("a.gz.1"), b"stale stale stale").unwrap();

        let parts = Chunker::new(4).chunk(&artifact, dir.path()).unwrap();
        assert_eq!(std::fs::read(&parts[&1]).unwrap(), b"abcd");
        assert_eq!(std::fs::read(&parts[&2]).unwrap(), b"ef");
    }

    #[test]
    fn test_empty_and_missing_artifacts_fail() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.gz");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(Chunker::default().chunk(&empty, dir.path()), Err(ChunkError::Empty(_))));
        assert!(matches!(
            Chunker::default().chunk(&dir.path().join("missing.gz"), dir.path()),
            Err(ChunkError::Unreadable { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn parts_cover_the_artifact(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            chunk_size in 1usize..700,
        ) {
            let dir = tempdir().unwrap();
            let artifact = dir.path().join("blob");
            std::fs::write(&artifact, &data).unwrap();

            let parts = Chunker::new(chunk_size).chunk_parts(&artifact, dir.path()).unwrap();
            prop_assert_eq!(parts.len(), data.len().div_ceil(chunk_size));

            let mut joined = Vec::with_capacity(data.len());
            for (i, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.part_number as usize, i + 1);
                joined.extend(std::fs::read(&part.path).unwrap());
            }
            prop_assert_eq!(joined, data);
        }
    }
}
