//! Pipewright Storage
//!
//! This crate provides the object storage trait used by pipewright to fetch
//! uploaded objects, list buckets for poll-based triggering and publish
//! packaged artifacts.
//!
//! The [`ObjectStore`] trait is the seam to the storage backend. Objects are
//! addressed by bucket and key, the way S3-compatible stores address them.
//! [`FsObjectStore`] keeps buckets as directories on the local filesystem.
//!
//! The trait uses async streaming for efficient handling of large files.

mod fs;

pub use fs::FsObjectStore;

use std::path::{Component, Path};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

/// A boxed stream of bytes for object data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested object does not exist.
  #[error("object not found: {bucket}/{key}")]
  NotFound { bucket: String, key: String },

  /// The bucket does not exist.
  #[error("bucket not found: {0}")]
  BucketNotFound(String),

  /// The key cannot address an object (empty, absolute, or escaping).
  #[error("invalid object key: {0}")]
  InvalidKey(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Metadata for a listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
  pub key: String,
  pub size: u64,
  /// Last modification time (Unix millis).
  pub last_modified: u64,
}

/// Object storage trait.
///
/// Implementations provide the actual storage backend (filesystem, S3, etc.).
#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Retrieve an object.
  ///
  /// Returns a stream of bytes for efficient handling of large files.
  async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, Error>;

  /// Store an object.
  async fn put(&self, bucket: &str, key: &str, data: ByteStream) -> Result<(), Error>;

  /// List the objects in a bucket whose keys start with `prefix`, ordered by key.
  async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, Error>;

  /// Delete an object.
  async fn delete(&self, bucket: &str, key: &str) -> Result<(), Error>;
}

/// Check that a key is a relative path that stays inside its bucket.
pub fn validate_key(key: &str) -> Result<(), Error> {
  if key.is_empty() || key.starts_with('/') {
    return Err(Error::InvalidKey(key.to_string()));
  }

  let escapes = Path::new(key)
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
  if escapes {
    return Err(Error::InvalidKey(key.to_string()));
  }

  Ok(())
}
