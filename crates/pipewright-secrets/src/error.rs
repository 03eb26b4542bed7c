use thiserror::Error;

/// Errors from credential resolution.
///
/// Messages name identifiers only, never values.
#[derive(Debug, Error)]
pub enum SecretsError {
  /// The backend has no value for the identifier.
  #[error("secret unavailable: {identifier}")]
  Unavailable { identifier: String },

  /// The identifier cannot be looked up by this backend.
  #[error("invalid secret identifier: {identifier}")]
  InvalidIdentifier { identifier: String },

  /// The backend failed while looking up the identifier.
  #[error("secrets backend error for '{identifier}': {message}")]
  Backend { identifier: String, message: String },
}

impl SecretsError {
  /// The identifier this error is about.
  pub fn identifier(&self) -> &str {
    match self {
      SecretsError::Unavailable { identifier }
      | SecretsError::InvalidIdentifier { identifier }
      | SecretsError::Backend { identifier, .. } => identifier,
    }
  }
}
