//! Content digests for cache-freshness checks.
//!
//! The spec file's sha256 is recorded as an annotation on the build
//! environment image and compared on reuse. Equal content must always yield
//! an equal digest; nothing here looks at paths or metadata.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{BuildError, Result};

/// Length of the short digest prefix used to namespace build outputs.
pub const SHORT_LEN: usize = 12;

/// Annotation value prefix, matching the OCI digest convention.
const ANNOTATION_PREFIX: &str = "sha256:";

/// Compute the lowercase hex sha256 of a file's contents.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let f = File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf).map_err(|e| BuildError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Leading slice of a digest, used to keep outputs from different spec
/// variants apart within one shared build directory.
pub fn short(hex: &str) -> &str {
    &hex[..SHORT_LEN.min(hex.len())]
}

/// Render a digest the way it is carried in an image annotation.
pub fn annotation_value(hex: &str) -> String {
    format!("{ANNOTATION_PREFIX}{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn empty_file_digest_is_known_vector() {
        let f = write_temp(b"");
        assert_eq!(
            sha256_hex(f.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn equal_content_equal_digest() {
        let a = write_temp(b"Name: pkg\nVersion: 1.0\n");
        let b = write_temp(b"Name: pkg\nVersion: 1.0\n");
        assert_eq!(sha256_hex(a.path()).unwrap(), sha256_hex(b.path()).unwrap());
    }

    #[test]
    fn distinct_content_distinct_digest() {
        let a = write_temp(b"Version: 1.0\n");
        let b = write_temp(b"Version: 1.1\n");
        assert_ne!(sha256_hex(a.path()).unwrap(), sha256_hex(b.path()).unwrap());
    }

    #[test]
    fn repeated_calls_are_stable() {
        let f = write_temp(b"stable");
        assert_eq!(sha256_hex(f.path()).unwrap(), sha256_hex(f.path()).unwrap());
    }

    #[test]
    fn short_prefix_and_annotation() {
        let hex = "0123456789abcdef0123456789abcdef";
        assert_eq!(short(hex), "0123456789ab");
        assert_eq!(short(hex).len(), SHORT_LEN);
        assert_eq!(annotation_value("ff00"), "sha256:ff00");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = sha256_hex(Path::new("/nonexistent/spec")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/spec"));
    }
}
