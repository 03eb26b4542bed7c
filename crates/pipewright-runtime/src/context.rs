//! Per-run state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipewright_artifact::Artifact;
use pipewright_secrets::SecretSet;
use pipewright_trigger::TriggerEvent;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::result::{StageResult, StageStatus};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Success,
  Failure,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::Pending => "pending",
      RunStatus::Success => "success",
      RunStatus::Failure => "failure",
    }
  }
}

/// Everything one run owns.
///
/// Created by [`TriggerListener::admit`](crate::TriggerListener::admit) and
/// consumed by [`RunReporter::finalize`](crate::RunReporter::finalize). The
/// status leaves `Pending` exactly once; the stage log is append-only.
#[derive(Debug)]
pub struct RunContext {
  run_id: String,
  pipeline_id: String,
  event: TriggerEvent,
  secrets: SecretSet,
  workspace: PathBuf,
  stage_index: usize,
  status: RunStatus,
  message: Option<String>,
  log: Vec<StageResult>,
  artifact: Option<Artifact>,
  admitted_at: DateTime<Utc>,
  deadline: Option<Instant>,
}

impl RunContext {
  /// Allocate a run with a fresh id and workspace `<workspace_base>/<run_id>`.
  pub fn new(pipeline_id: impl Into<String>, event: TriggerEvent, workspace_base: &Path) -> Self {
    let run_id = uuid::Uuid::new_v4().to_string();
    let workspace = workspace_base.join(&run_id);

    Self {
      run_id,
      pipeline_id: pipeline_id.into(),
      event,
      secrets: SecretSet::new(),
      workspace,
      stage_index: 0,
      status: RunStatus::Pending,
      message: None,
      log: Vec::new(),
      artifact: None,
      admitted_at: Utc::now(),
      deadline: None,
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn pipeline_id(&self) -> &str {
    &self.pipeline_id
  }

  /// The triggering event, as admitted.
  pub fn event(&self) -> &TriggerEvent {
    &self.event
  }

  /// The event as recorded: `bucket`, `key` and every extra field.
  pub fn event_fields(&self) -> BTreeMap<String, String> {
    self.event.to_map()
  }

  pub fn workspace(&self) -> &Path {
    &self.workspace
  }

  pub fn secrets(&self) -> &SecretSet {
    &self.secrets
  }

  pub fn status(&self) -> RunStatus {
    self.status
  }

  pub fn message(&self) -> Option<&str> {
    self.message.as_deref()
  }

  /// Index of the next stage to run.
  pub fn stage_index(&self) -> usize {
    self.stage_index
  }

  pub fn log(&self) -> &[StageResult] {
    &self.log
  }

  pub fn artifact(&self) -> Option<&Artifact> {
    self.artifact.as_ref()
  }

  pub fn admitted_at(&self) -> DateTime<Utc> {
    self.admitted_at
  }

  /// Time left before the global timeout, if the clock is running.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .deadline
      .map(|deadline| deadline.saturating_duration_since(Instant::now()))
  }

  pub(crate) fn start_clock(&mut self, timeout: Duration) {
    self.deadline = Some(Instant::now() + timeout);
  }

  pub(crate) fn set_secrets(&mut self, secrets: SecretSet) {
    self.secrets = secrets;
  }

  /// Zero the resolved credentials.
  pub(crate) fn clear_secrets(&mut self) {
    self.secrets.clear();
  }

  pub(crate) fn set_artifact(&mut self, artifact: Artifact) {
    self.artifact = Some(artifact);
  }

  pub(crate) fn record(&mut self, result: StageResult) {
    self.stage_index += 1;
    self.log.push(result);
  }

  /// Mark the run failed. Only the first terminal transition sticks.
  pub(crate) fn fail(&mut self, message: impl Into<String>) -> bool {
    if self.status != RunStatus::Pending {
      return false;
    }
    self.status = RunStatus::Failure;
    self.message = Some(message.into());
    true
  }

  /// Settle a still-pending run as successful.
  pub(crate) fn settle(&mut self) {
    if self.status == RunStatus::Pending {
      let ok = self
        .log
        .iter()
        .filter(|r| r.status == StageStatus::Ok)
        .count();
      self.status = RunStatus::Success;
      self.message = Some(format!(
        "pipeline '{}' completed: {} of {} stages ok",
        self.pipeline_id,
        ok,
        self.log.len()
      ));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pipewright_config::StageCategory;

  fn context() -> RunContext {
    RunContext::new(
      "logs",
      TriggerEvent::new("logs", "m1/data.tar"),
      Path::new("/tmp/pipewright"),
    )
  }

  #[test]
  fn test_workspace_is_under_base() {
    let ctx = context();
    assert_eq!(ctx.workspace(), Path::new("/tmp/pipewright").join(ctx.run_id()));
    assert_eq!(ctx.status(), RunStatus::Pending);
  }

  #[test]
  fn test_status_set_once() {
    let mut ctx = context();

    assert!(ctx.fail("fetch failed"));
    assert!(!ctx.fail("second failure"));
    ctx.settle();

    assert_eq!(ctx.status(), RunStatus::Failure);
    assert_eq!(ctx.message(), Some("fetch failed"));
  }

  #[test]
  fn test_settle_pending() {
    let mut ctx = context();
    ctx.record(StageResult::skipped("analyze", StageCategory::External));
    ctx.settle();

    assert_eq!(ctx.status(), RunStatus::Success);
    assert_eq!(ctx.stage_index(), 1);
    assert!(ctx.message().unwrap().contains("0 of 1"));
  }

  #[test]
  fn test_event_fields_recorded() {
    let ctx = context();
    let fields = ctx.event_fields();
    assert_eq!(fields["bucket"], "logs");
    assert_eq!(fields["key"], "m1/data.tar");
  }
}
