use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::enums::StageCategory;
use crate::input::InputValue;

/// One ordered unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
  pub name: String,
  #[serde(flatten)]
  pub kind: StageKind,
  /// A failure is recorded but does not abort the run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub best_effort: Option<bool>,
  /// The stage is still attempted after an earlier stage failed the run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub run_always: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
  /// Download the triggering object into `destination` (workspace-relative).
  Fetch {
    #[serde(default = "default_fetch_destination")]
    destination: String,
  },
  /// Unpack tar archives found under `dir` next to where they were found.
  Extract { dir: String },
  /// Run an external program with the workspace as working directory.
  Exec {
    command: String,
    #[serde(default)]
    args: Vec<InputValue>,
    #[serde(default)]
    env: BTreeMap<String, InputValue>,
  },
  /// Delete a workspace-relative path.
  Remove { path: InputValue },
  /// Bundle the output directories into the run's artifact.
  Package,
}

fn default_fetch_destination() -> String {
  "machines".to_string()
}

impl StageDef {
  pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
    Self {
      name: name.into(),
      kind,
      best_effort: None,
      run_always: None,
      timeout_ms: None,
    }
  }

  pub fn best_effort(mut self, best_effort: bool) -> Self {
    self.best_effort = Some(best_effort);
    self
  }

  pub fn run_always(mut self, run_always: bool) -> Self {
    self.run_always = Some(run_always);
    self
  }

  pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }

  /// Whether a failure of this stage is tolerated.
  ///
  /// Packaging is best-effort unless configured otherwise. Fetching never is.
  pub fn is_best_effort(&self) -> bool {
    match self.kind {
      StageKind::Fetch { .. } => false,
      StageKind::Package => self.best_effort.unwrap_or(true),
      _ => self.best_effort.unwrap_or(false),
    }
  }

  /// Whether this stage still runs after an earlier stage failed the run.
  pub fn runs_always(&self) -> bool {
    match self.kind {
      StageKind::Package => self.run_always.unwrap_or(true),
      _ => self.run_always.unwrap_or(false),
    }
  }

  pub fn category(&self) -> StageCategory {
    self.kind.category()
  }
}

impl StageKind {
  pub fn category(&self) -> StageCategory {
    match self {
      StageKind::Exec { .. } => StageCategory::External,
      _ => StageCategory::Filesystem,
    }
  }
}
