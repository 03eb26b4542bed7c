//! Integration tests for FsObjectStore.

use bytes::Bytes;
use futures::StreamExt;
use pipewright_storage::{ByteStream, Error, FsObjectStore, ObjectStore};

fn stream_of(data: &'static [u8]) -> ByteStream {
  Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
}

async fn collect(mut stream: ByteStream) -> Vec<u8> {
  let mut out = Vec::new();
  while let Some(chunk) = stream.next().await {
    out.extend_from_slice(&chunk.expect("chunk"));
  }
  out
}

#[tokio::test]
async fn test_put_then_get() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsObjectStore::new(dir.path());

  store
    .put("logs", "m1/data.tar", stream_of(b"payload"))
    .await
    .unwrap();

  let data = collect(store.get("logs", "m1/data.tar").await.unwrap()).await;
  assert_eq!(data, b"payload");
  assert!(dir.path().join("logs/m1/data.tar").exists());
}

#[tokio::test]
async fn test_get_missing_object() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(dir.path().join("logs")).unwrap();
  let store = FsObjectStore::new(dir.path());

  let err = store.get("logs", "missing.tar").await.err().unwrap();
  assert!(matches!(err, Error::NotFound { key, .. } if key == "missing.tar"));
}

#[tokio::test]
async fn test_get_rejects_escaping_key() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsObjectStore::new(dir.path());

  let err = store.get("logs", "../secrets").await.err().unwrap();
  assert!(matches!(err, Error::InvalidKey(_)));
}

#[tokio::test]
async fn test_list_with_prefix() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsObjectStore::new(dir.path());

  store.put("logs", "m2/b.tar", stream_of(b"bb")).await.unwrap();
  store.put("logs", "m1/a.tar", stream_of(b"a")).await.unwrap();
  store.put("logs", "other.txt", stream_of(b"o")).await.unwrap();

  let all = store.list("logs", "").await.unwrap();
  let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
  assert_eq!(keys, vec!["m1/a.tar", "m2/b.tar", "other.txt"]);
  assert_eq!(all[1].size, 2);
  assert!(all.iter().all(|o| o.last_modified > 0));

  let filtered = store.list("logs", "m").await.unwrap();
  assert_eq!(filtered.len(), 2);
}

#[tokio::test]
async fn test_list_missing_bucket() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsObjectStore::new(dir.path());

  assert!(matches!(
    store.list("nope", "").await,
    Err(Error::BucketNotFound(_))
  ));
}

#[tokio::test]
async fn test_delete() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsObjectStore::new(dir.path());

  store.put("logs", "a.tar", stream_of(b"a")).await.unwrap();
  store.delete("logs", "a.tar").await.unwrap();

  assert!(matches!(
    store.delete("logs", "a.tar").await,
    Err(Error::NotFound { .. })
  ));
}
