use std::path::{Path, PathBuf};

/// Error type for packaging operations.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
  /// An output directory is absolute or escapes the workspace.
  #[error("invalid output directory '{path}': {reason}")]
  InvalidPath { path: String, reason: String },

  /// Reading workspace content failed.
  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Writing the archive failed.
  #[error("failed to write archive '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The blocking packaging task panicked or was cancelled.
  #[error("packaging task failed: {0}")]
  Join(String),
}

impl PackageError {
  pub(crate) fn read(path: &Path, source: std::io::Error) -> Self {
    Self::Read {
      path: path.to_path_buf(),
      source,
    }
  }

  pub(crate) fn write(path: &Path, source: std::io::Error) -> Self {
    Self::Write {
      path: path.to_path_buf(),
      source,
    }
  }
}
