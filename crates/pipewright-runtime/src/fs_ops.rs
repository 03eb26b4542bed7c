//! In-process filesystem stages: archive extraction and path removal.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::{RuntimeError, WorkspaceError};
use crate::workspace::resolve_within;

const ARCHIVE_SUFFIXES: &[&str] = &[".tar", ".tar.gz", ".tgz", ".sdmp"];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack every archive found under `root/dir` into the directory that holds
/// it. Returns the archives that were unpacked, in path order.
pub(crate) async fn extract(root: &Path, dir: &str) -> Result<Vec<PathBuf>, RuntimeError> {
  let start = resolve_within(root, dir)?;
  if tokio::fs::symlink_metadata(&start).await.is_ok() {
    confine(root, &start, dir).await?;
  }

  let extracted = tokio::task::spawn_blocking(move || extract_all(&start))
    .await
    .map_err(|e| RuntimeError::StageExecution {
      stage: "extract".to_string(),
      message: e.to_string(),
    })??;

  info!(archives = extracted.len(), "archives_extracted");
  Ok(extracted)
}

fn extract_all(start: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
  let mut archives = Vec::new();
  let mut stack = vec![start.to_path_buf()];

  while let Some(dir) = stack.pop() {
    let entries = match std::fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == start => {
        debug!(dir = %dir.display(), "nothing to extract");
        return Ok(archives);
      }
      Err(e) => return Err(WorkspaceError::io(&dir, e)),
    };
    for entry in entries {
      let entry = entry.map_err(|e| WorkspaceError::io(&dir, e))?;
      let path = entry.path();
      // Never followed: an unpacked archive may carry links out of the workspace.
      let kind = entry.file_type().map_err(|e| WorkspaceError::io(&path, e))?;
      if kind.is_symlink() {
        debug!(path = %path.display(), "skipping symlink");
      } else if kind.is_dir() {
        stack.push(path);
      } else if is_archive(&path) {
        archives.push(path);
      }
    }
  }

  // Archives unpacked below are not themselves unpacked again.
  archives.sort();
  for archive in &archives {
    unpack(archive)?;
  }
  Ok(archives)
}

fn is_archive(path: &Path) -> bool {
  path
    .file_name()
    .and_then(|n| n.to_str())
    .map(|name| {
      let name = name.to_ascii_lowercase();
      ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    })
    .unwrap_or(false)
}

/// Unpack a tar archive next to itself, gunzipping first when the content
/// is gzip-compressed regardless of its extension.
fn unpack(archive: &Path) -> Result<(), WorkspaceError> {
  let parent = archive.parent().unwrap_or(Path::new("."));
  let mut file = File::open(archive).map_err(|e| WorkspaceError::io(archive, e))?;

  let mut magic = [0u8; 2];
  let compressed = match file.read_exact(&mut magic) {
    Ok(()) => magic == GZIP_MAGIC,
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
    Err(e) => return Err(WorkspaceError::io(archive, e)),
  };
  let file = File::open(archive).map_err(|e| WorkspaceError::io(archive, e))?;
  let reader: Box<dyn Read> = if compressed {
    Box::new(GzDecoder::new(BufReader::new(file)))
  } else {
    Box::new(BufReader::new(file))
  };

  // `unpack` refuses entries that would land outside `parent`.
  tar::Archive::new(reader)
    .unpack(parent)
    .map_err(|e| WorkspaceError::io(archive, e))?;

  debug!(archive = %archive.display(), compressed, "archive unpacked");
  Ok(())
}

/// Delete a workspace-relative file or directory. Missing paths are fine.
pub(crate) async fn remove(root: &Path, relative: &str) -> Result<bool, RuntimeError> {
  let target = resolve_within(root, relative)?;

  let meta = match tokio::fs::symlink_metadata(&target).await {
    Ok(meta) => meta,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      debug!(path = %target.display(), "nothing to remove");
      return Ok(false);
    }
    Err(e) => return Err(WorkspaceError::io(&target, e).into()),
  };
  if let Some(parent) = target.parent() {
    confine(root, parent, relative).await?;
  }

  let removed = if meta.is_dir() {
    tokio::fs::remove_dir_all(&target).await
  } else {
    tokio::fs::remove_file(&target).await
  };
  removed.map_err(|e| WorkspaceError::io(&target, e))?;

  info!(path = %target.display(), "path_removed");
  Ok(true)
}

/// Refuse `path` when, with symlinks resolved, it lies outside `root`.
async fn confine(root: &Path, path: &Path, relative: &str) -> Result<(), WorkspaceError> {
  let real_root = tokio::fs::canonicalize(root)
    .await
    .map_err(|e| WorkspaceError::io(root, e))?;
  let real = tokio::fs::canonicalize(path)
    .await
    .map_err(|e| WorkspaceError::io(path, e))?;

  if real.starts_with(&real_root) {
    Ok(())
  } else {
    Err(WorkspaceError::invalid(
      relative,
      "path resolves outside the workspace",
    ))
  }
}
