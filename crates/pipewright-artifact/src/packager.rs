use std::collections::BTreeMap;
use std::fs::{File, Metadata};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::PackageError;

/// Hex characters of the digest used in the bundle file name.
const NAME_DIGEST_LEN: usize = 12;

/// A packaged output bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
  /// File name, `<name>-<digest prefix>.tar.gz`.
  pub name: String,
  /// Where the bundle was written.
  pub path: PathBuf,
  /// Content address of the compressed bundle, `sha256:<hex>`.
  pub digest: String,
  /// Compressed size in bytes.
  pub size: u64,
  /// Archived paths, relative to the workspace root, in archive order.
  pub entries: Vec<String>,
  pub created_at: DateTime<Utc>,
}

/// Builds deterministic `.tar.gz` bundles from workspace directories.
#[derive(Debug, Clone)]
pub struct ArtifactPackager {
  name: String,
}

enum EntryKind {
  Dir,
  File { executable: bool },
}

struct Entry {
  source: PathBuf,
  kind: EntryKind,
}

impl ArtifactPackager {
  /// `name` prefixes every bundle this packager writes (usually the pipeline id).
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  /// Archive `output_dirs` (relative to `root`) into a bundle under `destination`.
  ///
  /// Output directories that do not exist are skipped, producing a partial
  /// bundle. Packaging the same content twice yields byte-identical files.
  #[instrument(name = "artifact_package", skip_all, fields(name = %self.name))]
  pub async fn package(
    &self,
    root: &Path,
    output_dirs: &[String],
    destination: &Path,
  ) -> Result<Artifact, PackageError> {
    let name = self.name.clone();
    let root = root.to_path_buf();
    let output_dirs = output_dirs.to_vec();
    let destination = destination.to_path_buf();

    let artifact = tokio::task::spawn_blocking(move || {
      build_bundle(&name, &root, &output_dirs, &destination)
    })
    .await
    .map_err(|e| PackageError::Join(e.to_string()))??;

    info!(
      artifact = %artifact.name,
      digest = %artifact.digest,
      size = artifact.size,
      entries = artifact.entries.len(),
      "artifact_created"
    );

    Ok(artifact)
  }
}

fn build_bundle(
  name: &str,
  root: &Path,
  output_dirs: &[String],
  destination: &Path,
) -> Result<Artifact, PackageError> {
  let entries = collect_entries(root, output_dirs)?;

  std::fs::create_dir_all(destination).map_err(|e| PackageError::write(destination, e))?;
  let mut staging = tempfile::Builder::new()
    .prefix(".bundle-")
    .suffix(".part")
    .tempfile_in(destination)
    .map_err(|e| PackageError::write(destination, e))?;
  let staging_path = staging.path().to_path_buf();

  let writer = HashingWriter::new(staging.as_file_mut());
  let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
  for (entry_name, entry) in &entries {
    append_entry(&mut builder, entry_name, entry)?;
  }
  let (digest, size) = builder
    .into_inner()
    .and_then(|encoder| encoder.finish())
    .map_err(|e| PackageError::write(&staging_path, e))?
    .finish();

  let hex = format!("{:x}", digest);
  let file_name = format!("{}-{}.tar.gz", name, &hex[..NAME_DIGEST_LEN]);
  let path = destination.join(&file_name);
  staging
    .persist(&path)
    .map_err(|e| PackageError::write(&path, e.error))?;

  Ok(Artifact {
    name: file_name,
    path,
    digest: format!("sha256:{}", hex),
    size,
    entries: entries.into_keys().collect(),
    created_at: Utc::now(),
  })
}

/// Gather every directory and regular file under the output directories,
/// keyed (and therefore sorted) by workspace-relative path.
fn collect_entries(
  root: &Path,
  output_dirs: &[String],
) -> Result<BTreeMap<String, Entry>, PackageError> {
  let mut entries = BTreeMap::new();

  for dir in output_dirs {
    check_relative(dir)?;
    let path = root.join(dir);
    match std::fs::symlink_metadata(&path) {
      Ok(meta) if meta.is_dir() => walk(root, &path, &mut entries)?,
      Ok(_) => warn!(dir = %dir, "output path is not a directory, skipping"),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        warn!(dir = %dir, "output directory missing, skipping")
      }
      Err(e) => return Err(PackageError::read(&path, e)),
    }
  }

  Ok(entries)
}

fn walk(
  root: &Path,
  start: &Path,
  entries: &mut BTreeMap<String, Entry>,
) -> Result<(), PackageError> {
  let mut stack = vec![start.to_path_buf()];

  while let Some(dir) = stack.pop() {
    entries.insert(
      relative_name(root, &dir)?,
      Entry {
        source: dir.clone(),
        kind: EntryKind::Dir,
      },
    );

    let read_dir = std::fs::read_dir(&dir).map_err(|e| PackageError::read(&dir, e))?;
    for child in read_dir {
      let child = child.map_err(|e| PackageError::read(&dir, e))?;
      let path = child.path();
      let meta = std::fs::symlink_metadata(&path).map_err(|e| PackageError::read(&path, e))?;

      if meta.is_dir() {
        stack.push(path);
      } else if meta.is_file() {
        entries.insert(
          relative_name(root, &path)?,
          Entry {
            source: path,
            kind: EntryKind::File {
              executable: is_executable(&meta),
            },
          },
        );
      } else {
        debug!(path = %path.display(), "skipping non-regular file");
      }
    }
  }

  Ok(())
}

fn append_entry<W: Write>(
  builder: &mut tar::Builder<W>,
  name: &str,
  entry: &Entry,
) -> Result<(), PackageError> {
  let mut header = tar::Header::new_gnu();
  header.set_mtime(0);
  header.set_uid(0);
  header.set_gid(0);

  match entry.kind {
    EntryKind::Dir => {
      header.set_entry_type(tar::EntryType::Directory);
      header.set_mode(0o755);
      header.set_size(0);
      builder
        .append_data(&mut header, name, io::empty())
        .map_err(|e| PackageError::read(&entry.source, e))
    }
    EntryKind::File { executable } => {
      let file = File::open(&entry.source).map_err(|e| PackageError::read(&entry.source, e))?;
      let len = file
        .metadata()
        .map_err(|e| PackageError::read(&entry.source, e))?
        .len();
      header.set_entry_type(tar::EntryType::Regular);
      header.set_mode(if executable { 0o755 } else { 0o644 });
      header.set_size(len);
      builder
        .append_data(&mut header, name, file)
        .map_err(|e| PackageError::read(&entry.source, e))
    }
  }
}

fn check_relative(dir: &str) -> Result<(), PackageError> {
  let invalid = |reason: &str| PackageError::InvalidPath {
    path: dir.to_string(),
    reason: reason.to_string(),
  };

  if dir.is_empty() {
    return Err(invalid("path is empty"));
  }
  for component in Path::new(dir).components() {
    match component {
      Component::ParentDir => return Err(invalid("path escapes the workspace")),
      Component::RootDir | Component::Prefix(_) => return Err(invalid("path must be relative")),
      _ => {}
    }
  }
  Ok(())
}

/// `/`-separated path relative to the workspace root.
fn relative_name(root: &Path, path: &Path) -> Result<String, PackageError> {
  let invalid = |reason: &str| PackageError::InvalidPath {
    path: path.display().to_string(),
    reason: reason.to_string(),
  };

  let relative = path
    .strip_prefix(root)
    .map_err(|_| invalid("outside the workspace"))?;

  let mut parts = Vec::new();
  for component in relative.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| invalid("not valid UTF-8"))?),
      Component::CurDir => {}
      _ => return Err(invalid("outside the workspace")),
    }
  }
  Ok(parts.join("/"))
}

#[cfg(unix)]
fn is_executable(meta: &Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &Metadata) -> bool {
  false
}

/// Hashes and counts everything written through it.
struct HashingWriter<W> {
  inner: W,
  hasher: Sha256,
  written: u64,
}

impl<W: Write> HashingWriter<W> {
  fn new(inner: W) -> Self {
    Self {
      inner,
      hasher: Sha256::new(),
      written: 0,
    }
  }

  fn finish(self) -> (sha2::digest::Output<Sha256>, u64) {
    (self.hasher.finalize(), self.written)
  }
}

impl<W: Write> Write for HashingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.inner.write(buf)?;
    self.hasher.update(&buf[..n]);
    self.written += n as u64;
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}
