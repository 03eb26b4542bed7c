//! Runtime error types.

use std::path::{Path, PathBuf};

use pipewright_artifact::PackageError;
use pipewright_config::ConfigError;
use pipewright_secrets::SecretsError;

/// Errors preparing or touching the run's workspace.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
  /// The path is absolute or would leave the workspace root.
  #[error("invalid workspace path '{path}': {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("workspace i/o failed at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl WorkspaceError {
  pub(crate) fn invalid(path: &str, reason: &str) -> Self {
    Self::InvalidPath {
      path: path.to_string(),
      reason: reason.to_string(),
    }
  }

  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Errors downloading the triggering object.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("object not found: {bucket}/{key}")]
  NotFound { bucket: String, key: String },

  #[error("invalid object key '{0}'")]
  InvalidKey(String),

  /// The object store could not be reached or refused the request.
  #[error("object store unreachable: {message}")]
  Unreachable { message: String },

  /// The transfer started but did not complete.
  #[error("transfer of {bucket}/{key} interrupted: {message}")]
  Interrupted {
    bucket: String,
    key: String,
    message: String,
  },

  /// Writing the downloaded object locally failed.
  #[error("failed to write '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Errors that can occur while running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,

  /// A stage ran past its time limit.
  #[error("stage '{stage}' timed out after {timeout_ms} ms")]
  Timeout { stage: String, timeout_ms: u64 },

  /// An external program could not be started or waited on.
  #[error("stage '{stage}' failed: {message}")]
  StageExecution { stage: String, message: String },

  /// An external program exited unsuccessfully.
  #[error("stage '{stage}' exited with {}", describe_exit(.code))]
  ExitStatus { stage: String, code: Option<i32> },

  /// Failed to render a stage template.
  #[error("template resolution failed for stage '{stage}': {message}")]
  Template { stage: String, message: String },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Secrets(#[from] SecretsError),

  #[error(transparent)]
  Workspace(#[from] WorkspaceError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Package(#[from] PackageError),

  /// Publishing the artifact to object storage failed.
  #[error("failed to publish artifact: {0}")]
  Publish(#[source] pipewright_storage::Error),

  /// Writing the run report failed.
  #[error("failed to persist run report: {0}")]
  Persistence(String),
}

impl RuntimeError {
  /// Exit code of the external program, if one ran to completion.
  pub fn exit_code(&self) -> Option<i32> {
    match self {
      RuntimeError::ExitStatus { code, .. } => *code,
      _ => None,
    }
  }
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("code {}", code),
    None => "no exit code (terminated by signal)".to_string(),
  }
}
