//! Artifact discovery with cardinality checks.
//!
//! Build steps look for artifacts (a generated source package, say) in the
//! shared build directory by glob pattern. Exactly one match is the only
//! acceptable answer: more than one means we would be guessing which
//! sources to build from, and none means the producer step has to run.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// All files under `dir` matching `pattern`, sorted for stable reporting.
pub fn find_matches(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = dir.join(pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full)
        .map_err(|e| BuildError::Config(format!("invalid artifact pattern '{pattern}': {e}")))?;
    let mut matches: Vec<PathBuf> = paths
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Reduce matches to the unique artifact.
///
/// `Ok(Some(_))` for exactly one, `Ok(None)` for zero (the caller decides
/// whether to trigger the producer step), `AmbiguousArtifact` for more.
pub fn unique(matches: Vec<PathBuf>, pattern: &str) -> Result<Option<PathBuf>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        count => Err(BuildError::AmbiguousArtifact {
            pattern: pattern.to_string(),
            count,
        }),
    }
}

/// Find the unique artifact matching `pattern` under `dir`.
pub fn find_unique(dir: &Path, pattern: &str) -> Result<Option<PathBuf>> {
    unique(find_matches(dir, pattern)?, pattern)
}
