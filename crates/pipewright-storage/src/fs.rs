use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{ByteStream, Error, ObjectInfo, ObjectStore, validate_key};

/// Filesystem-based object store.
///
/// Each bucket is a directory under the base path and each object is stored
/// at `{base_path}/{bucket}/{key}`. Parent directories are created
/// automatically on `put`.
pub struct FsObjectStore {
  base_path: PathBuf,
}

impl FsObjectStore {
  /// Create a new filesystem store with the given base path.
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn bucket_path(&self, bucket: &str) -> Result<PathBuf, Error> {
    validate_key(bucket).map_err(|_| Error::BucketNotFound(bucket.to_string()))?;
    Ok(self.base_path.join(bucket))
  }

  fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, Error> {
    validate_key(key)?;
    Ok(self.bucket_path(bucket)?.join(key))
  }

  fn not_found(bucket: &str, key: &str) -> Error {
    Error::NotFound {
      bucket: bucket.to_string(),
      key: key.to_string(),
    }
  }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
  async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, Error> {
    let path = self.object_path(bucket, key)?;
    let file = File::open(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Self::not_found(bucket, key)
      } else {
        Error::Io(e)
      }
    })?;

    // Directories open fine on unix but are not objects.
    if file.metadata().await?.is_dir() {
      return Err(Self::not_found(bucket, key));
    }

    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn put(&self, bucket: &str, key: &str, data: ByteStream) -> Result<(), Error> {
    let path = self.object_path(bucket, key)?;

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(path).await?;
    let mut stream = std::pin::pin!(data);

    while let Some(chunk) = stream.next().await {
      let bytes = chunk?;
      file.write_all(&bytes).await?;
    }

    file.flush().await?;
    Ok(())
  }

  async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, Error> {
    let root = self.bucket_path(bucket)?;
    if !fs::try_exists(&root).await? {
      return Err(Error::BucketNotFound(bucket.to_string()));
    }

    let mut objects = Vec::new();
    let mut pending = vec![(root, String::new())];

    while let Some((dir, key_prefix)) = pending.pop() {
      let mut entries = fs::read_dir(&dir).await?;
      while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
          continue;
        };
        let key = format!("{}{}", key_prefix, name);
        let metadata = entry.metadata().await?;

        if metadata.is_dir() {
          pending.push((entry.path(), format!("{}/", key)));
          continue;
        }

        if !key.starts_with(prefix) {
          continue;
        }

        let last_modified = metadata
          .modified()
          .ok()
          .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
          .map(|d| d.as_millis() as u64)
          .unwrap_or(0);

        objects.push(ObjectInfo {
          key,
          size: metadata.len(),
          last_modified,
        });
      }
    }

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
  }

  async fn delete(&self, bucket: &str, key: &str) -> Result<(), Error> {
    let path = self.object_path(bucket, key)?;
    fs::remove_file(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Self::not_found(bucket, key)
      } else {
        Error::Io(e)
      }
    })
  }
}
