use serde::{Deserialize, Serialize};

/// A credential the pipeline needs, by symbolic identifier.
///
/// The identifier is what the secrets backend understands (e.g.
/// `minio-access-key-id`); `env` is the variable the external programs see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub env: Option<String>,
}

impl SecretRef {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      env: None,
    }
  }

  /// Name of the environment variable exposed to stages.
  ///
  /// Defaults to the identifier upper-cased with `-` and `.` replaced by `_`:
  /// `minio-access-key-id` becomes `MINIO_ACCESS_KEY_ID`.
  pub fn env_var(&self) -> String {
    match &self.env {
      Some(env) => env.clone(),
      None => self
        .id
        .chars()
        .map(|c| match c {
          '-' | '.' => '_',
          c => c.to_ascii_uppercase(),
        })
        .collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_env_var() {
    assert_eq!(
      SecretRef::new("minio-access-key-id").env_var(),
      "MINIO_ACCESS_KEY_ID"
    );
    assert_eq!(SecretRef::new("mongo.user").env_var(), "MONGO_USER");
  }

  #[test]
  fn test_explicit_env_var() {
    let secret = SecretRef {
      id: "mongo-user".to_string(),
      env: Some("MONGO_USERNAME".to_string()),
    };
    assert_eq!(secret.env_var(), "MONGO_USERNAME");
  }
}
