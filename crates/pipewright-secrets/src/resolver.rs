use std::sync::Arc;

use pipewright_config::SecretRef;
use tracing::{info, instrument, warn};

use crate::backend::SecretsBackend;
use crate::error::SecretsError;
use crate::set::SecretSet;

/// Resolves a pipeline's declared credentials against a backend.
#[derive(Clone)]
pub struct SecretResolver {
  backend: Arc<dyn SecretsBackend>,
}

impl SecretResolver {
  pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
    Self { backend }
  }

  /// Resolve every reference, or none of them.
  ///
  /// On the first missing or failing identifier the values gathered so far
  /// are zeroed and the error names that identifier.
  #[instrument(name = "secrets_resolve", skip_all, fields(count = refs.len()))]
  pub async fn resolve(&self, refs: &[SecretRef]) -> Result<SecretSet, SecretsError> {
    let mut set = SecretSet::new();

    for secret in refs {
      match self.backend.get(&secret.id).await {
        Ok(Some(value)) => set.insert(secret.id.clone(), secret.env_var(), value),
        Ok(None) => {
          warn!(identifier = %secret.id, "secret unavailable");
          set.clear();
          return Err(SecretsError::Unavailable {
            identifier: secret.id.clone(),
          });
        }
        Err(e) => {
          warn!(identifier = %secret.id, error = %e, "secret lookup failed");
          set.clear();
          return Err(e);
        }
      }
    }

    info!(identifiers = ?set.identifiers().collect::<Vec<_>>(), "secrets resolved");
    Ok(set)
  }
}
