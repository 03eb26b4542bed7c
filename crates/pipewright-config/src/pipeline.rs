use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::enums::TriggerDef;
use crate::error::ConfigError;
use crate::input::InputValue;
use crate::secret::SecretRef;
use crate::stage::{StageDef, StageKind};

/// Thirty minutes.
const DEFAULT_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  pub pipeline_id: String,
  pub name: String,
  pub trigger: TriggerDef,
  #[serde(default)]
  pub workspace: WorkspaceDef,
  /// Credentials resolved at run start and exposed to exec stages.
  #[serde(default)]
  pub secrets: Vec<SecretRef>,
  /// Non-secret environment shared by every exec stage (endpoints, ports,
  /// database names). Values are templates.
  #[serde(default)]
  pub env: BTreeMap<String, InputValue>,
  /// Pass the orchestrator's own environment through to exec stages.
  #[serde(default = "default_true")]
  pub inherit_env: bool,
  pub stages: Vec<StageDef>,
  #[serde(default)]
  pub package: PackageDef,
  #[serde(default)]
  pub hooks: HooksDef,
  /// Ceiling for the whole run, in milliseconds.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

/// Layout of the per-run working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDef {
  /// Directories created under the workspace root before any stage runs.
  #[serde(default = "default_directories")]
  pub directories: Vec<String>,
  /// Delete the workspace once the run is finalized.
  #[serde(default)]
  pub remove_on_finish: bool,
}

impl Default for WorkspaceDef {
  fn default() -> Self {
    Self {
      directories: default_directories(),
      remove_on_finish: false,
    }
  }
}

fn default_directories() -> Vec<String> {
  vec![
    "machines".to_string(),
    "output".to_string(),
    "processed".to_string(),
  ]
}

/// What goes into the run's artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDef {
  /// Workspace-relative directories bundled into the archive.
  #[serde(default = "default_output_dirs")]
  pub output_dirs: Vec<String>,
  /// Also upload the archive to this bucket.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub publish_bucket: Option<String>,
}

impl Default for PackageDef {
  fn default() -> Self {
    Self {
      output_dirs: default_output_dirs(),
      publish_bucket: None,
    }
  }
}

fn default_output_dirs() -> Vec<String> {
  vec!["output".to_string(), "processed".to_string()]
}

/// Commands run after the terminal status is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksDef {
  #[serde(default)]
  pub on_success: Vec<HookDef>,
  #[serde(default)]
  pub on_failure: Vec<HookDef>,
  #[serde(default)]
  pub always: Vec<HookDef>,
}

impl HooksDef {
  pub fn is_empty(&self) -> bool {
    self.on_success.is_empty() && self.on_failure.is_empty() && self.always.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDef {
  pub name: String,
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
  true
}

impl PipelineDef {
  /// Parse a JSON pipeline definition and validate it.
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let def: PipelineDef = serde_json::from_str(json)?;
    def.validate()?;
    Ok(def)
  }

  /// Effective global timeout in milliseconds.
  pub fn timeout_ms(&self) -> u64 {
    self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
  }

  /// Check the invariants the runtime relies on.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.pipeline_id.trim().is_empty() {
      return Err(ConfigError::MissingField("pipeline_id"));
    }
    let id_ok = self
      .pipeline_id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !id_ok || self.pipeline_id == "." || self.pipeline_id == ".." {
      return Err(ConfigError::InvalidPipelineId(self.pipeline_id.clone()));
    }
    if self.stages.is_empty() {
      return Err(ConfigError::NoStages(self.pipeline_id.clone()));
    }

    let mut names = HashSet::new();
    for stage in &self.stages {
      if !names.insert(stage.name.as_str()) {
        return Err(ConfigError::DuplicateStage(stage.name.clone()));
      }

      match &stage.kind {
        StageKind::Fetch { destination } => {
          if stage.best_effort == Some(true) {
            return Err(ConfigError::BestEffortFetch(stage.name.clone()));
          }
          check_relative(destination)?;
        }
        StageKind::Extract { dir } => check_relative(dir)?,
        StageKind::Exec { command, .. } => {
          if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
              stage: stage.name.clone(),
            });
          }
        }
        // Rendered at runtime; checked against the workspace then.
        StageKind::Remove { .. } => {}
        StageKind::Package => {}
      }
    }

    for dir in self
      .workspace
      .directories
      .iter()
      .chain(self.package.output_dirs.iter())
    {
      check_relative(dir)?;
    }

    for hook in self
      .hooks
      .on_success
      .iter()
      .chain(&self.hooks.on_failure)
      .chain(&self.hooks.always)
    {
      if hook.command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand {
          stage: hook.name.clone(),
        });
      }
    }

    Ok(())
  }
}

/// A workspace path must stay inside the workspace.
fn check_relative(path: &str) -> Result<(), ConfigError> {
  let invalid = |reason: &str| ConfigError::InvalidPath {
    path: path.to_string(),
    reason: reason.to_string(),
  };

  if path.trim().is_empty() {
    return Err(invalid("empty path"));
  }

  for component in Path::new(path).components() {
    match component {
      Component::Normal(_) | Component::CurDir => {}
      Component::ParentDir => return Err(invalid("parent directory references are not allowed")),
      Component::RootDir | Component::Prefix(_) => {
        return Err(invalid("path must be relative to the workspace"));
      }
    }
  }

  Ok(())
}
