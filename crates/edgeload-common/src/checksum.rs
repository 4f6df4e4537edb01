//! Checksums for digested artifacts
//!
//! A digested artifact is sealed by a `<file>.sha256` sidecar written in the
//! `sha256sum` layout (`<hex>  <file name>`). A later run trusts the artifact
//! only when the sidecar is present and still matches the bytes on disk.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_BUFFER_SIZE: usize = 8192;

/// Extension appended to an artifact name to form its sidecar.
pub const SIDECAR_EXTENSION: &str = "sha256";

/// Hex SHA-256 of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Verify a file against an expected hex digest.
///
/// Returns `ChecksumMismatch` rather than `Ok(false)` so callers can surface
/// both digests.
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Location of the SHA-256 sidecar for `path`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Hash `path` and write its sidecar, returning the digest.
pub fn write_sidecar(path: &Path) -> Result<String> {
    let digest = compute_file_checksum(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::fs::write(sidecar_path(path), format!("{}  {}\n", digest, file_name))?;
    Ok(digest)
}

/// Read the digest recorded in the sidecar of `path`, if there is one.
pub fn read_sidecar(path: &Path) -> Result<Option<String>> {
    let sidecar = sidecar_path(path);
    let contents = match std::fs::read_to_string(&sidecar) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let digest = contents
        .split_whitespace()
        .next()
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| CommonError::MalformedSidecar(sidecar.display().to_string()))?;
    Ok(Some(digest.to_ascii_lowercase()))
}

/// True when `path` has a sidecar and the bytes still match it.
///
/// A missing sidecar or a mismatch is `Ok(false)`; only I/O failures and a
/// garbled sidecar are errors.
pub fn verify_sidecar(path: &Path) -> Result<bool> {
    let Some(expected) = read_sidecar(path)? else {
        return Ok(false);
    };
    match verify_file_checksum(path, &expected) {
        Ok(()) => Ok(true),
        Err(CommonError::ChecksumMismatch { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove `path` together with its sidecar, ignoring files that are already gone.
pub fn remove_with_sidecar(path: &Path) -> Result<()> {
    for target in [path.to_path_buf(), sidecar_path(path)] {
        match std::fs::remove_file(&target) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_sidecar_round_trip_and_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("job1.sales.gz");
        std::fs::write(&artifact, b"compressed bytes").unwrap();

        assert!(!verify_sidecar(&artifact).unwrap());

        let digest = write_sidecar(&artifact).unwrap();
        assert_eq!(read_sidecar(&artifact).unwrap(), Some(digest));
        assert!(verify_sidecar(&artifact).unwrap());

        std::fs::write(&artifact, b"truncated").unwrap();
        assert!(!verify_sidecar(&artifact).unwrap());

        remove_with_sidecar(&artifact).unwrap();
        assert!(!artifact.exists());
        assert!(!sidecar_path(&artifact).exists());
    }

    #[test]
    fn test_sidecar_sits_next_to_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("job1.sales.gz");
        std::fs::write(&artifact, b"abc").unwrap();

        assert_eq!(sidecar_path(&artifact), dir.path().join("job1.sales.gz.sha256"));
        let digest = write_sidecar(&artifact).unwrap();
        let line = std::fs::read_to_string(sidecar_path(&artifact)).unwrap();
        assert_eq!(line, format!("{digest}  job1.sales.gz\n"));

        match verify_file_checksum(&artifact, &"0".repeat(64)) {
            Err(CommonError::ChecksumMismatch { expected, actual, .. }) => {
                assert_eq!(expected, "0".repeat(64));
                assert_eq!(actual, digest);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.gz");
        std::fs::write(&artifact, b"x").unwrap();
        std::fs::write(sidecar_path(&artifact), "not-a-digest a.gz\n").unwrap();

        assert!(matches!(
            verify_sidecar(&artifact),
            Err(CommonError::MalformedSidecar(_))
        ));
    }

    proptest! {
        #[test]
        fn streamed_digest_matches_one_shot(data in proptest::collection::vec(any::<u8>(), 0..40_000)) {
            let streamed = compute_checksum(&mut Cursor::new(&data)).unwrap();
            prop_assert_eq!(streamed, hex::encode(Sha256::digest(&data)));
        }
    }
}
