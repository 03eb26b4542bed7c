//! Execution result types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pipewright_artifact::Artifact;
use pipewright_config::StageCategory;
use pipewright_trigger::Position;
use serde::{Deserialize, Serialize};

use crate::context::RunStatus;
use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
  Ok,
  Failed,
  TimedOut,
  Skipped,
}

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
  pub stage: String,
  pub category: StageCategory,
  pub status: StageStatus,
  /// Exit code of the external program, when one ran to completion.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
  /// Failure description, with credential values masked.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  pub duration_ms: u64,
}

impl StageResult {
  pub fn skipped(stage: impl Into<String>, category: StageCategory) -> Self {
    Self {
      stage: stage.into(),
      category,
      status: StageStatus::Skipped,
      exit_code: None,
      error: None,
      started_at: None,
      duration_ms: 0,
    }
  }

  /// Whether the stage was actually started.
  pub fn started(&self) -> bool {
    self.status != StageStatus::Skipped
  }
}

/// The externally visible outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
  pub run_id: String,
  pub pipeline_id: String,
  /// The triggering event, as recorded.
  pub event: BTreeMap<String, String>,
  pub status: RunStatus,
  pub message: String,
  pub stages: Vec<StageResult>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifact: Option<Artifact>,
  pub workspace: PathBuf,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  /// Poll watermark carried by the event, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub watermark: Option<Position>,
}

impl RunReport {
  pub fn is_success(&self) -> bool {
    self.status == RunStatus::Success
  }

  /// Result for a stage by name.
  pub fn stage(&self, name: &str) -> Option<&StageResult> {
    self.stages.iter().find(|r| r.stage == name)
  }

  /// Number of stages of `category` that were started.
  pub fn started_count(&self, category: StageCategory) -> usize {
    self
      .stages
      .iter()
      .filter(|r| r.category == category && r.started())
      .count()
  }

  /// Write the report as `<dir>/<run_id>.json`.
  pub async fn persist(&self, dir: &Path) -> Result<PathBuf, RuntimeError> {
    let path = dir.join(format!("{}.json", self.run_id));
    let body =
      serde_json::to_vec_pretty(self).map_err(|e| RuntimeError::Persistence(e.to_string()))?;

    tokio::fs::create_dir_all(dir)
      .await
      .map_err(|e| RuntimeError::Persistence(format!("{}: {}", dir.display(), e)))?;
    tokio::fs::write(&path, body)
      .await
      .map_err(|e| RuntimeError::Persistence(format!("{}: {}", path.display(), e)))?;

    Ok(path)
  }
}
