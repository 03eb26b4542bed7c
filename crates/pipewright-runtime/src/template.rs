//! Stage template rendering using minijinja.
//!
//! Exec arguments, environment values and cleanup paths are rendered against
//! the run before the stage starts. The context is flat:
//!
//! ```json
//! { "run_id": "…", "pipeline_id": "logs", "source": "logs",
//!   "key": "HPE_Lab-01/dump.sdmp", "machine": "hpe-lab-01",
//!   "workspace": "/var/lib/pipewright/workspaces/…",
//!   "fields": { "event_name": "s3:ObjectCreated:Put" } }
//! ```
//!
//! Credentials are not part of the context; stages receive them only as
//! environment variables.

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior, Value};
use serde_json::json;

use crate::context::RunContext;
use crate::error::RuntimeError;

/// Build a strict environment: referencing an unknown variable is an error
/// rather than an empty string.
pub(crate) fn environment() -> Environment<'static> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);
  env
}

/// The template context for a run.
pub(crate) fn context_for(ctx: &RunContext) -> Value {
  let event = ctx.event();
  Value::from_serialize(json!({
    "run_id": ctx.run_id(),
    "pipeline_id": ctx.pipeline_id(),
    "source": event.source,
    "key": event.key,
    "machine": machine_name(&event.key),
    "workspace": ctx.workspace().display().to_string(),
    "fields": event.fields,
  }))
}

/// Render one template string.
pub(crate) fn render(
  env: &Environment,
  stage: &str,
  template: &str,
  context: &Value,
) -> Result<String, RuntimeError> {
  env
    .render_str(template, context.clone())
    .map_err(|e| RuntimeError::Template {
      stage: stage.to_string(),
      message: format!("failed to render '{}': {}", template, e),
    })
}

/// Render every value of a map, keeping the keys.
pub(crate) fn render_map(
  env: &Environment,
  stage: &str,
  templates: &BTreeMap<String, String>,
  context: &Value,
) -> Result<Vec<(String, String)>, RuntimeError> {
  templates
    .iter()
    .map(|(name, template)| Ok((name.clone(), render(env, stage, template, context)?)))
    .collect()
}

/// The machine an object belongs to: the first segment of its key, or the
/// file stem for a top-level object.
fn machine_name(key: &str) -> String {
  let first = match key.split_once('/') {
    Some((dir, _)) => dir,
    None => key.split('.').next().unwrap_or(key),
  };
  sanitize_machine_name(first)
}

/// Normalise a machine name for use as a directory or collection name.
///
/// Lowercases, maps `_` and spaces to `-`, drops anything outside
/// `[a-z0-9.-]`, collapses repeated separators and trims `.`/`-` from both
/// ends. An input with nothing usable left becomes `unknown-machine`.
pub fn sanitize_machine_name(raw: &str) -> String {
  let mut out = String::with_capacity(raw.len());

  for c in raw.chars().flat_map(char::to_lowercase) {
    let c = match c {
      '_' | ' ' => '-',
      c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' => c,
      _ => continue,
    };
    let repeated = matches!(c, '-' | '.') && out.ends_with(c);
    if !repeated {
      out.push(c);
    }
  }

  let trimmed = out.trim_matches(|c| c == '-' || c == '.');
  if trimmed.is_empty() {
    "unknown-machine".to_string()
  } else {
    trimmed.to_string()
  }
}
