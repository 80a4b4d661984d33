use std::{io, path::PathBuf};

use thiserror::Error;

/// Terminal failure kinds of a package build. Cancellation travels the same
/// channel so recursive matching can unwind immediately, but it is reported
/// as an outcome, never as a failure.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("output setup failed for {}: {source}; the file may be locked or the directory read-only", path.display())]
    Setup {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("resource update failed for {}: {reason}", path.display())]
    ResourceCommit { path: PathBuf, reason: String },
    #[error("metadata placeholder not found in {}: the executable template is missing or incompatible", .0.display())]
    MetadataSignatureNotFound(PathBuf),
    #[error("external archiver failed: {0}")]
    ExternalTool(String),
    #[error("rejected archive input: {0}")]
    Archive(String),
    #[error("invalid project: {0}")]
    Project(String),
    #[error("build cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BuildError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }

    pub(crate) fn setup(path: &std::path::Path, source: io::Error) -> Self {
        BuildError::Setup {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn commit(path: &std::path::Path, reason: impl Into<String>) -> Self {
        BuildError::ResourceCommit {
            path:   path.to_path_buf(),
            reason: reason.into(),
        }
    }
}
