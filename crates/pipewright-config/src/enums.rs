use serde::{Deserialize, Serialize};

/// How runs of a pipeline are triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerDef {
  /// An upload notification is pushed to the pipeline.
  Webhook,
  /// The pipeline lists a bucket periodically and picks up new objects.
  Poll {
    bucket: String,
    #[serde(default)]
    prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    interval_ms: u64,
  },
}

fn default_poll_interval_ms() -> u64 {
  60_000
}

/// The two kinds of work a stage can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
  /// Local filesystem or object-store work done in-process.
  Filesystem,
  /// Invocation of an external program.
  External,
}
