use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::error::WorkspaceError;

/// Sets up and tears down a run's working directory.
pub struct WorkspacePreparer;

impl WorkspacePreparer {
  /// Create `root` and each of `directories` beneath it.
  ///
  /// Idempotent: existing directories are left as they are.
  #[instrument(name = "workspace_prepare", skip_all, fields(root = %root.display()))]
  pub async fn prepare(root: &Path, directories: &[String]) -> Result<(), WorkspaceError> {
    let targets = directories
      .iter()
      .map(|dir| resolve_within(root, dir))
      .collect::<Result<Vec<_>, _>>()?;

    tokio::fs::create_dir_all(root)
      .await
      .map_err(|e| WorkspaceError::io(root, e))?;
    for target in &targets {
      tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| WorkspaceError::io(target, e))?;
    }

    info!(directories = targets.len(), "workspace_prepared");
    Ok(())
  }

  /// Delete the workspace. A workspace that no longer exists is fine.
  pub async fn remove(root: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_dir_all(root).await {
      Ok(()) => {
        debug!(root = %root.display(), "workspace removed");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(WorkspaceError::io(root, e)),
    }
  }
}

/// Join a workspace-relative path onto `root`, refusing anything that would
/// leave it. The root itself is not a valid target.
pub(crate) fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
  if relative.trim().is_empty() {
    return Err(WorkspaceError::invalid(relative, "empty path"));
  }

  let mut resolved = root.to_path_buf();
  let mut depth = 0;
  for component in Path::new(relative).components() {
    match component {
      Component::Normal(part) => {
        resolved.push(part);
        depth += 1;
      }
      Component::CurDir => {}
      Component::ParentDir => {
        return Err(WorkspaceError::invalid(
          relative,
          "parent directory references are not allowed",
        ));
      }
      Component::RootDir | Component::Prefix(_) => {
        return Err(WorkspaceError::invalid(
          relative,
          "path must be relative to the workspace",
        ));
      }
    }
  }

  if depth == 0 {
    return Err(WorkspaceError::invalid(relative, "path is the workspace root"));
  }
  Ok(resolved)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_resolve_within() {
    let root = Path::new("/work/run");
    assert_eq!(
      resolve_within(root, "output/m1").unwrap(),
      Path::new("/work/run/output/m1")
    );
    assert_eq!(
      resolve_within(root, "./machines").unwrap(),
      Path::new("/work/run/machines")
    );
    assert!(resolve_within(root, "../other").is_err());
    assert!(resolve_within(root, "output/../../x").is_err());
    assert!(resolve_within(root, "/etc").is_err());
    assert!(resolve_within(root, ".").is_err());
    assert!(resolve_within(root, "").is_err());
  }

  #[tokio::test]
  async fn test_prepare_is_idempotent() {
    let base = TempDir::new().unwrap();
    let root = base.path().join("run-1");
    let dirs = vec!["machines".to_string(), "output/m1".to_string()];

    WorkspacePreparer::prepare(&root, &dirs).await.unwrap();
    tokio::fs::write(root.join("output/m1/keep.log"), "x").await.unwrap();
    WorkspacePreparer::prepare(&root, &dirs).await.unwrap();

    assert!(root.join("machines").is_dir());
    assert!(root.join("output/m1/keep.log").is_file());
  }

  #[tokio::test]
  async fn test_prepare_rejects_escape_before_creating_anything() {
    let base = TempDir::new().unwrap();
    let root = base.path().join("run-1");

    let err = WorkspacePreparer::prepare(&root, &["../escape".to_string()])
      .await
      .unwrap_err();

    assert!(matches!(err, WorkspaceError::InvalidPath { .. }));
    assert!(!root.exists());
  }

  #[tokio::test]
  async fn test_prepare_io_error() {
    let base = TempDir::new().unwrap();
    let root = base.path().join("run-1");
    tokio::fs::write(&root, "not a directory").await.unwrap();

    let err = WorkspacePreparer::prepare(&root, &["output".to_string()])
      .await
      .unwrap_err();
    assert!(matches!(err, WorkspaceError::Io { .. }));
  }

  #[tokio::test]
  async fn test_remove() {
    let base = TempDir::new().unwrap();
    let root = base.path().join("run-1");
    WorkspacePreparer::prepare(&root, &["output".to_string()])
      .await
      .unwrap();

    WorkspacePreparer::remove(&root).await.unwrap();
    assert!(!root.exists());
    WorkspacePreparer::remove(&root).await.unwrap();
  }
}
