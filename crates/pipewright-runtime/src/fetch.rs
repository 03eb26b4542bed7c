use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use pipewright_storage::{Error as StorageError, ObjectStore, validate_key};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::FetchError;

/// Downloads triggering objects into the workspace.
#[derive(Clone)]
pub struct ObjectFetcher {
  store: Arc<dyn ObjectStore>,
}

impl ObjectFetcher {
  pub fn new(store: Arc<dyn ObjectStore>) -> Self {
    Self { store }
  }

  /// Stream `bucket/key` to `<destination_dir>/<key>`.
  ///
  /// The object is written to a `.part` file and renamed into place once
  /// complete, so the final path only ever holds a whole object.
  #[instrument(name = "object_fetch", skip(self, destination_dir), fields(bucket = %bucket, key = %key))]
  pub async fn fetch(
    &self,
    bucket: &str,
    key: &str,
    destination_dir: &Path,
  ) -> Result<PathBuf, FetchError> {
    validate_key(key).map_err(|_| FetchError::InvalidKey(key.to_string()))?;

    let target = destination_dir.join(key);
    let partial = part_path(&target);
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| FetchError::Io {
          path: parent.to_path_buf(),
          source: e,
        })?;
    }

    let mut stream = self
      .store
      .get(bucket, key)
      .await
      .map_err(|e| map_store_error(bucket, key, e))?;

    let mut guard = PartialDownload::new(partial.clone());
    let mut file = tokio::fs::File::create(&partial)
      .await
      .map_err(|e| FetchError::Io {
        path: partial.clone(),
        source: e,
      })?;

    let mut bytes = 0u64;
    let copied: Result<(), FetchError> = async {
      while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Interrupted {
          bucket: bucket.to_string(),
          key: key.to_string(),
          message: e.to_string(),
        })?;
        file.write_all(&chunk).await.map_err(|e| FetchError::Io {
          path: partial.clone(),
          source: e,
        })?;
        bytes += chunk.len() as u64;
      }
      file.flush().await.map_err(|e| FetchError::Io {
        path: partial.clone(),
        source: e,
      })
    }
    .await;
    drop(file);

    if let Err(e) = copied {
      warn!(error = %e, "fetch aborted, discarding partial download");
      return Err(e);
    }

    tokio::fs::rename(&partial, &target)
      .await
      .map_err(|e| FetchError::Io {
        path: target.clone(),
        source: e,
      })?;
    guard.keep();

    info!(bytes, path = %target.display(), "object_fetched");
    Ok(target)
  }
}

/// Deletes an unfinished `.part` file when dropped, including when the fetch
/// is abandoned on timeout or cancellation.
struct PartialDownload {
  path: Option<PathBuf>,
}

impl PartialDownload {
  fn new(path: PathBuf) -> Self {
    Self { path: Some(path) }
  }

  fn keep(&mut self) {
    self.path = None;
  }
}

impl Drop for PartialDownload {
  fn drop(&mut self) {
    if let Some(path) = self.path.take() {
      match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "partial download removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
      }
    }
  }
}

fn part_path(target: &Path) -> PathBuf {
  let mut name = target
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_else(OsString::new);
  name.push(".part");
  target.with_file_name(name)
}

fn map_store_error(bucket: &str, key: &str, err: StorageError) -> FetchError {
  match err {
    StorageError::NotFound { .. } | StorageError::BucketNotFound(_) => FetchError::NotFound {
      bucket: bucket.to_string(),
      key: key.to_string(),
    },
    StorageError::InvalidKey(key) => FetchError::InvalidKey(key),
    StorageError::Io(e) => FetchError::Unreachable {
      message: e.to_string(),
    },
  }
}
