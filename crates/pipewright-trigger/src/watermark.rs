use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::TriggerError;

/// A point in a bucket listing: modification time (unix millis), then key.
///
/// Ordered by time first and key second, so objects sharing a timestamp are
/// still taken one at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
  pub last_modified: u64,
  #[serde(default)]
  pub key: String,
}

impl Position {
  pub fn new(last_modified: u64, key: impl Into<String>) -> Self {
    Self {
      last_modified,
      key: key.into(),
    }
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.key.is_empty() {
      write!(f, "{}", self.last_modified)
    } else {
      write!(f, "{} ({})", self.last_modified, self.key)
    }
  }
}

/// Last object taken from a polled bucket.
///
/// Only ever moves forward. Shared between the poller and finished runs.
#[derive(Debug, Default)]
pub struct Watermark {
  position: Mutex<Position>,
}

impl Watermark {
  pub fn new(initial: Position) -> Self {
    Self {
      position: Mutex::new(initial),
    }
  }

  pub fn current(&self) -> Position {
    self
      .position
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Move the watermark to `position` if that is newer. Returns whether it
  /// moved.
  pub fn advance(&self, position: Position) -> bool {
    let mut current = self
      .position
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if position > *current {
      *current = position;
      true
    } else {
      false
    }
  }

  /// Load a persisted watermark. A missing file starts from the beginning.
  ///
  /// Files holding only `last_modified` load with an empty key.
  pub async fn load(path: &Path) -> Result<Self, TriggerError> {
    match tokio::fs::read(path).await {
      Ok(bytes) => {
        let position: Position = serde_json::from_slice(&bytes).map_err(|e| {
          TriggerError::Persistence(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Self::new(position))
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
      Err(e) => Err(TriggerError::Persistence(format!(
        "failed to read {}: {}",
        path.display(),
        e
      ))),
    }
  }

  /// Write the current position, replacing the file atomically.
  pub async fn persist(&self, path: &Path) -> Result<(), TriggerError> {
    let body =
      serde_json::to_vec(&self.current()).map_err(|e| TriggerError::Persistence(e.to_string()))?;

    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| TriggerError::Persistence(format!("failed to create {}: {}", parent.display(), e)))?;
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body)
      .await
      .map_err(|e| TriggerError::Persistence(format!("failed to write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
      .await
      .map_err(|e| TriggerError::Persistence(format!("failed to write {}: {}", path.display(), e)))
  }
}
