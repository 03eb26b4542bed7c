//! Secrets backends.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use pipewright_config::SecretRef;
use tokio::fs;

use crate::error::SecretsError;

/// Source of credential values.
///
/// Returns `Ok(None)` when the backend simply has no value for the
/// identifier; the resolver turns that into [`SecretsError::Unavailable`].
#[async_trait]
pub trait SecretsBackend: Send + Sync {
  async fn get(&self, identifier: &str) -> Result<Option<String>, SecretsError>;

  /// Variables of this process's own environment that hold the value for
  /// `identifier`. Child processes never inherit them.
  fn env_sources(&self, _identifier: &str) -> Vec<String> {
    Vec::new()
  }
}

/// Reads secrets from environment variables.
///
/// The identifier `minio-access-key-id` is looked up as
/// `{prefix}MINIO_ACCESS_KEY_ID`.
pub struct EnvBackend {
  prefix: String,
  snapshot: Option<HashMap<String, String>>,
}

impl EnvBackend {
  /// Look up variables in the process environment at resolution time.
  pub fn new() -> Self {
    Self {
      prefix: String::new(),
      snapshot: None,
    }
  }

  /// Look up variables in a fixed set instead of the process environment.
  pub fn from_vars<I, K, V>(vars: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    Self {
      prefix: String::new(),
      snapshot: Some(
        vars
          .into_iter()
          .map(|(k, v)| (k.into(), v.into()))
          .collect(),
      ),
    }
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  fn var_name(&self, identifier: &str) -> String {
    format!("{}{}", self.prefix, SecretRef::new(identifier).env_var())
  }
}

impl Default for EnvBackend {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl SecretsBackend for EnvBackend {
  async fn get(&self, identifier: &str) -> Result<Option<String>, SecretsError> {
    let name = self.var_name(identifier);
    let value = match &self.snapshot {
      Some(vars) => vars.get(&name).cloned(),
      None => std::env::var(&name).ok(),
    };
    Ok(value)
  }

  /// The mapped variable, plus every variable under a non-empty prefix.
  fn env_sources(&self, identifier: &str) -> Vec<String> {
    let mut names = vec![self.var_name(identifier)];
    if self.snapshot.is_none() && !self.prefix.is_empty() {
      names.extend(
        std::env::vars_os()
          .filter_map(|(name, _)| name.into_string().ok())
          .filter(|name| name.starts_with(&self.prefix)),
      );
    }
    names.sort();
    names.dedup();
    names
  }
}

/// Reads secrets from one file per identifier, as mounted by container
/// runtimes (`/run/secrets/<identifier>`).
pub struct FileBackend {
  dir: PathBuf,
}

impl FileBackend {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }
}

#[async_trait]
impl SecretsBackend for FileBackend {
  async fn get(&self, identifier: &str) -> Result<Option<String>, SecretsError> {
    if identifier.is_empty()
      || identifier.contains(['/', '\\'])
      || identifier == "."
      || identifier == ".."
    {
      return Err(SecretsError::InvalidIdentifier {
        identifier: identifier.to_string(),
      });
    }

    match fs::read_to_string(self.dir.join(identifier)).await {
      Ok(contents) => Ok(Some(contents.trim_end_matches(['\n', '\r']).to_string())),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(SecretsError::Backend {
        identifier: identifier.to_string(),
        message: e.kind().to_string(),
      }),
    }
  }
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
  values: HashMap<String, String>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, identifier: impl Into<String>, value: impl Into<String>) -> Self {
    self.values.insert(identifier.into(), value.into());
    self
  }
}

#[async_trait]
impl SecretsBackend for MemoryBackend {
  async fn get(&self, identifier: &str) -> Result<Option<String>, SecretsError> {
    Ok(self.values.get(identifier).cloned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_env_backend_maps_identifier() {
    let backend = EnvBackend::from_vars([("MINIO_ACCESS_KEY_ID", "AKIA")]);

    assert_eq!(
      backend.get("minio-access-key-id").await.unwrap().as_deref(),
      Some("AKIA")
    );
    assert_eq!(backend.get("mongo-user").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_env_backend_prefix() {
    let backend =
      EnvBackend::from_vars([("PW_SECRET_MONGO_USER", "admin")]).with_prefix("PW_SECRET_");

    assert_eq!(
      backend.get("mongo-user").await.unwrap().as_deref(),
      Some("admin")
    );
  }

  #[test]
  fn test_env_backend_sources() {
    let backend = EnvBackend::new();
    assert_eq!(backend.env_sources("mongo-password"), vec!["MONGO_PASSWORD"]);

    let backend = EnvBackend::from_vars([("PW_SECRET_MONGO_USER", "admin")]).with_prefix("PW_SECRET_");
    assert_eq!(backend.env_sources("mongo-user"), vec!["PW_SECRET_MONGO_USER"]);

    assert!(MemoryBackend::new().env_sources("mongo-user").is_empty());
  }

  #[tokio::test]
  async fn test_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("mongo-user"), "admin\n").unwrap();
    let backend = FileBackend::new(dir.path());

    assert_eq!(
      backend.get("mongo-user").await.unwrap().as_deref(),
      Some("admin")
    );
    assert_eq!(backend.get("mongo-password").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_file_backend_rejects_paths() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new(dir.path());

    assert!(matches!(
      backend.get("../etc/passwd").await,
      Err(SecretsError::InvalidIdentifier { .. })
    ));
  }
}
