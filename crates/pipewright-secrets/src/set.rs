use std::borrow::Cow;
use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// Values shorter than this are not masked by [`SecretSet::redact`]; masking
/// one- or two-character strings would mangle unrelated output.
const MIN_REDACT_LEN: usize = 4;

const MASK: &str = "****";

struct Entry {
  identifier: String,
  env: String,
  value: Zeroizing<String>,
}

/// The credentials resolved for one run.
///
/// Values are zeroed on [`clear`](SecretSet::clear) and on drop.
#[derive(Default)]
pub struct SecretSet {
  entries: Vec<Entry>,
}

impl SecretSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn insert(&mut self, identifier: String, env: String, value: String) {
    self.entries.retain(|e| e.identifier != identifier);
    self.entries.push(Entry {
      identifier,
      env,
      value: Zeroizing::new(value),
    });
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Value for a symbolic identifier.
  pub fn get(&self, identifier: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|e| e.identifier == identifier)
      .map(|e| e.value.as_str())
  }

  /// Identifiers held, in resolution order.
  pub fn identifiers(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|e| e.identifier.as_str())
  }

  /// `(variable, value)` pairs to expose to a child process.
  pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .map(|e| (e.env.as_str(), e.value.as_str()))
  }

  /// Mask every secret value that occurs in `text`.
  pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
    let mut out = Cow::Borrowed(text);
    for entry in &self.entries {
      let value = entry.value.as_str();
      if value.len() >= MIN_REDACT_LEN && out.contains(value) {
        out = Cow::Owned(out.replace(value, MASK));
      }
    }
    out
  }

  /// Zero and drop every value.
  pub fn clear(&mut self) {
    for entry in &mut self.entries {
      entry.value.zeroize();
    }
    self.entries.clear();
  }
}

impl fmt::Debug for SecretSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map()
      .entries(self.entries.iter().map(|e| (&e.identifier, MASK)))
      .finish()
  }
}
