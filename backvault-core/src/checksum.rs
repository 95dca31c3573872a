/*!
SHA-256 content checksums used for change detection and restore verification.
*/

use crate::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 of `data` as lowercase hex
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream a file through SHA-256 without loading it whole
///
/// # Arguments
/// * `path` - File to hash
///
/// # Returns
/// Hex digest of the file content
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| BackupError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).map_err(|e| BackupError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that `data` hashes to `expected`
///
/// # Returns
/// Ok(()) if the hash matches, Err(BackupError::ChecksumMismatch) otherwise
pub fn verify(data: &[u8], expected: &str) -> Result<()> {
    let actual = compute_hash(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(BackupError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_content_hash() {
        // SHA-256 of "test data" should be consistent
        assert_eq!(
            compute_hash(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_hash_file_matches_in_memory_hash() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![7u8; READ_BUFFER_SIZE * 2 + 17];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(hash_file(file.path()).unwrap(), compute_hash(&data));
    }

    #[test]
    fn test_hash_missing_file() {
        let result = hash_file(Path::new("/definitely/not/here.bin"));
        assert!(matches!(result, Err(BackupError::LocalIo { .. })));
    }

    #[test]
    fn test_verify() {
        let expected = compute_hash(b"x");
        assert!(verify(b"x", &expected).is_ok());
        assert!(verify(b"x", &expected.to_uppercase()).is_ok());

        match verify(b"y", &expected) {
            Err(BackupError::ChecksumMismatch { expected: e, .. }) => assert_eq!(e, expected),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }
}
