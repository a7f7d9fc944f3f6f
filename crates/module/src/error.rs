use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("invalid module name `{0}`")]
    InvalidModuleName(String),
    #[error("entity #{index} is invalid: {reason}")]
    InvalidEntity { index: usize, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Why an install did not complete.  Every variant is returned only after the
/// install's scratch directory has been released and without a registry
/// record being written.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("module `{0}` not found")]
    NotFound(String),
    #[error("fetching `{url}` failed: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("fetching `{url}` timed out after {timeout_secs}s")]
    FetchTimedOut { url: String, timeout_secs: u64 },
    #[error("integrity verification failed for {path}: digest {digest}")]
    VerificationFailed { path: PathBuf, digest: String },
    #[error("malformed archive: {0}")]
    MalformedArchive(String),
    #[error("install step {index} has unsupported action `{action}`")]
    UnsupportedStep { index: usize, action: String },
    #[error("install step {index} (`{action}`) failed: {source}")]
    StepFailed {
        index: usize,
        action: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("install of `{0}` cancelled")]
    Cancelled(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<ArchiveError> for InstallError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(err) => Self::Io(err),
            ArchiveError::Malformed(reason) => Self::MalformedArchive(reason),
            ArchiveError::Interrupted => Self::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "archive extraction interrupted",
            )),
        }
    }
}

impl InstallError {
    pub(crate) fn step(index: usize, action: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::StepFailed {
            index,
            action: action.to_string(),
            source: source.into(),
        }
    }
}
