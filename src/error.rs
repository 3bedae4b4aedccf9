//! Error types for build orchestration.
//!
//! Every failure the engine can surface is a distinct variant so that call
//! sites can tell a dry-run skip apart from a genuine command failure, and
//! so the binary can report each kind with the right wording.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the build engine and its collaborators.
#[derive(Debug, Error)]
pub enum BuildError {
    /// An external command exited non-zero (outside dry-run mode).
    #[error("command failed (exit {status}): {command}\n{output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// Dry-run sentinel: the command was rendered and logged but never run.
    ///
    /// Not a failure. Call sites that have nothing else to do swallow this
    /// via [`crate::runner::skip_on_dry_run`].
    #[error("not executed (dry-run): {0}")]
    DidNotExecute(String),

    /// A cached build-environment image records a spec digest that disagrees
    /// with the spec file on disk. Never silently rebuilt or reused.
    #[error("spec digest mismatch: image records {recorded}, current spec file is {current}")]
    DigestMismatch { recorded: String, current: String },

    /// More than one file matched a pattern expected to identify exactly one
    /// artifact. Guessing would silently build from the wrong sources.
    #[error(
        "ambiguous artifact: {count} files match '{pattern}' where exactly one was expected \
         (rename or remove the unwanted ones and try again)"
    )]
    AmbiguousArtifact { pattern: String, count: usize },

    /// The artifact was still missing after its producer step ran.
    #[error("no artifact matching '{pattern}' even after running its producer step")]
    MissingArtifact { pattern: String },

    /// None of the permitted image acquisition strategies succeeded.
    #[error("no available image source (permitted: {0})")]
    NoImageSource(String),

    /// Prerequisite resolution re-entered a step that is already running.
    #[error("prerequisite cycle detected at step '{0}'")]
    Cycle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// Attach a path to an io::Error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
