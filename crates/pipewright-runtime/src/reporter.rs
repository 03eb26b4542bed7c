use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipewright_config::{HookDef, HooksDef};
use pipewright_secrets::SecretSet;
use tracing::{error, info, instrument, warn};

use crate::context::{RunContext, RunStatus};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::process::{self, ProcessSpec};
use crate::result::RunReport;
use crate::workspace::WorkspacePreparer;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Settles and publishes the outcome of a run.
pub struct RunReporter {
  hooks: HooksDef,
  remove_workspace: bool,
  inherit_env: bool,
  scrub_env: Vec<String>,
  runs_dir: Option<PathBuf>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl RunReporter {
  pub fn new(hooks: HooksDef) -> Self {
    Self {
      hooks,
      remove_workspace: false,
      inherit_env: true,
      scrub_env: Vec::new(),
      runs_dir: None,
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Delete the workspace once the run is finalized.
  pub fn remove_workspace(mut self, remove: bool) -> Self {
    self.remove_workspace = remove;
    self
  }

  pub fn inherit_env(mut self, inherit: bool) -> Self {
    self.inherit_env = inherit;
    self
  }

  /// Inherited variables hooks must never see.
  pub fn scrub_env(mut self, names: Vec<String>) -> Self {
    self.scrub_env = names;
    self
  }

  /// Persist each report as `<dir>/<run_id>.json`.
  pub fn runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.runs_dir = Some(dir.into());
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Finalize a run. Consumes the context, so it happens exactly once.
  ///
  /// Settles a still-pending status as success and zeroes the credentials,
  /// then runs the hooks for the outcome followed by the `always` hooks and
  /// removes the workspace if configured. Hook failures are logged and never
  /// change the status.
  #[instrument(name = "run_finalize", skip_all, fields(run_id = %ctx.run_id()))]
  pub async fn finalize(&self, mut ctx: RunContext) -> RunReport {
    ctx.settle();
    ctx.clear_secrets();

    let status = ctx.status();
    let message = ctx.message().unwrap_or_default().to_string();
    match status {
      RunStatus::Failure => error!(pipeline_id = %ctx.pipeline_id(), message = %message, "run_failed"),
      _ => info!(pipeline_id = %ctx.pipeline_id(), message = %message, "run_succeeded"),
    }

    let outcome_hooks = match status {
      RunStatus::Failure => &self.hooks.on_failure,
      _ => &self.hooks.on_success,
    };
    for hook in outcome_hooks.iter().chain(&self.hooks.always) {
      self.run_hook(hook, &ctx, &message).await;
    }

    if self.remove_workspace {
      match WorkspacePreparer::remove(ctx.workspace()).await {
        Ok(()) => info!(workspace = %ctx.workspace().display(), "workspace_removed"),
        Err(e) => warn!(error = %e, "failed to remove workspace"),
      }
    }

    let report = RunReport {
      run_id: ctx.run_id().to_string(),
      pipeline_id: ctx.pipeline_id().to_string(),
      event: ctx.event_fields(),
      status,
      message: message.clone(),
      stages: ctx.log().to_vec(),
      artifact: ctx.artifact().cloned(),
      workspace: ctx.workspace().to_path_buf(),
      started_at: ctx.admitted_at(),
      finished_at: Utc::now(),
      watermark: ctx.event().watermark.clone(),
    };

    self.notifier.notify(ExecutionEvent::RunFinished {
      run_id: report.run_id.clone(),
      status,
      message,
    });

    if let Some(dir) = &self.runs_dir {
      match report.persist(dir).await {
        Ok(path) => info!(path = %path.display(), "run_report_written"),
        Err(e) => warn!(error = %e, "failed to write run report"),
      }
    }

    report
  }

  async fn run_hook(&self, hook: &HookDef, ctx: &RunContext, message: &str) {
    let workspace = ctx.workspace();
    let spec = ProcessSpec {
      name: &hook.name,
      program: &hook.command,
      args: hook.args.clone(),
      env: vec![
        ("PIPEWRIGHT_RUN_ID".to_string(), ctx.run_id().to_string()),
        ("PIPEWRIGHT_PIPELINE_ID".to_string(), ctx.pipeline_id().to_string()),
        ("PIPEWRIGHT_STATUS".to_string(), ctx.status().as_str().to_string()),
        ("PIPEWRIGHT_MESSAGE".to_string(), message.to_string()),
      ],
      inherit_env: self.inherit_env,
      scrub_env: &self.scrub_env,
      cwd: workspace.is_dir().then_some(workspace),
    };
    let timeout = hook
      .timeout_ms
      .map(Duration::from_millis)
      .unwrap_or(DEFAULT_HOOK_TIMEOUT);

    // Hooks never see credentials.
    let no_secrets = SecretSet::new();
    match tokio::time::timeout(timeout, process::run(spec, &no_secrets)).await {
      Ok(Ok(_)) => info!(hook = %hook.name, "hook_completed"),
      Ok(Err(e)) => warn!(hook = %hook.name, error = %e, "hook_failed"),
      Err(_) => warn!(hook = %hook.name, timeout_ms = timeout.as_millis() as u64, "hook_timed_out"),
    }
  }
}
