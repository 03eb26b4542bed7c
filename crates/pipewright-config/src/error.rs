use thiserror::Error;

/// Errors raised while loading or validating a pipeline definition.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to parse pipeline definition: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("pipeline '{0}' has no stages")]
  NoStages(String),

  #[error("duplicate stage name: {0}")]
  DuplicateStage(String),

  #[error("fetch stage '{0}' cannot be best-effort")]
  BestEffortFetch(String),

  #[error("stage '{stage}' has an empty command")]
  EmptyCommand { stage: String },

  #[error("invalid workspace path '{path}': {reason}")]
  InvalidPath { path: String, reason: String },

  /// Pipeline ids name files, so they are limited to `[A-Za-z0-9._-]`.
  #[error("invalid pipeline id '{0}': use letters, digits, '.', '_' or '-'")]
  InvalidPipelineId(String),

  #[error("missing required field: {0}")]
  MissingField(&'static str),
}
