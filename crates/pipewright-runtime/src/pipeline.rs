//! Pipeline orchestration.
//!
//! The [`Pipeline`] struct is the main entry point for running a pipeline.
//! It owns a validated definition and wires the listener, secret resolver,
//! stage runner and reporter together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pipewright_config::PipelineDef;
use pipewright_secrets::{SecretResolver, SecretsBackend};
use pipewright_storage::ObjectStore;
use pipewright_trigger::{InboundEvent, TriggerError, TriggerMode, Watermark};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::context::RunContext;
use crate::error::RuntimeError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::listener::TriggerListener;
use crate::reporter::RunReporter;
use crate::result::RunReport;
use crate::stage::StageRunner;
use crate::workspace::WorkspacePreparer;

/// Filesystem locations used by the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Parent of every run's workspace (`<workspace_base>/<run_id>`).
  pub workspace_base: PathBuf,
  /// Where packaged bundles are written.
  pub artifact_dir: PathBuf,
  /// Where run reports are written, if anywhere.
  pub runs_dir: Option<PathBuf>,
}

impl RuntimeConfig {
  /// The standard layout under a data directory.
  pub fn from_data_dir(data_dir: &Path) -> Self {
    Self {
      workspace_base: data_dir.join("workspaces"),
      artifact_dir: data_dir.join("artifacts"),
      runs_dir: Some(data_dir.join("runs")),
    }
  }
}

/// A loaded, validated pipeline.
pub struct Pipeline {
  def: Arc<PipelineDef>,
  config: RuntimeConfig,
  listener: TriggerListener,
  resolver: SecretResolver,
  runner: StageRunner,
  reporter: RunReporter,
  scrub_env: Vec<String>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl Pipeline {
  /// Validate `def` and build the pipeline.
  pub fn new(
    def: PipelineDef,
    config: RuntimeConfig,
    store: Arc<dyn ObjectStore>,
    secrets: Arc<dyn SecretsBackend>,
  ) -> Result<Self, RuntimeError> {
    def.validate()?;
    let def = Arc::new(def);

    let listener = TriggerListener::new(
      def.pipeline_id.clone(),
      TriggerMode::from(&def.trigger),
      config.workspace_base.clone(),
    );
    let scrub_env = credential_env_vars(&def, secrets.as_ref());
    let runner = StageRunner::new(def.clone(), store, config.artifact_dir.clone())
      .with_scrubbed_env(scrub_env.clone());

    let mut pipeline = Self {
      def,
      config,
      listener,
      resolver: SecretResolver::new(secrets),
      runner,
      reporter: RunReporter::new(Default::default()),
      scrub_env,
      notifier: Arc::new(NoopNotifier),
    };
    pipeline.reporter = pipeline.build_reporter();
    Ok(pipeline)
  }

  /// Route execution events to `notifier`.
  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self.runner = self.runner.with_notifier(self.notifier.clone());
    self.reporter = self.build_reporter();
    self
  }

  /// Share a poll watermark with other components.
  pub fn with_watermark(mut self, watermark: Arc<Watermark>) -> Self {
    self.listener = self.listener.with_watermark(watermark);
    self
  }

  pub fn def(&self) -> &PipelineDef {
    &self.def
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  pub fn listener(&self) -> &TriggerListener {
    &self.listener
  }

  /// Validate an inbound event and allocate its run. Nothing executes.
  pub fn admit(&self, event: InboundEvent) -> Result<RunContext, TriggerError> {
    self.listener.admit(event)
  }

  /// Run an admitted context to completion and finalize it.
  #[instrument(
    name = "pipeline_execute",
    skip_all,
    fields(pipeline_id = %self.def.pipeline_id, run_id = %ctx.run_id())
  )]
  pub async fn execute(&self, mut ctx: RunContext, cancel: CancellationToken) -> RunReport {
    info!(
      bucket = %ctx.event().source,
      key = %ctx.event().key,
      workspace = %ctx.workspace().display(),
      "run_started"
    );
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: ctx.run_id().to_string(),
      pipeline_id: self.def.pipeline_id.clone(),
    });
    ctx.start_clock(Duration::from_millis(self.def.timeout_ms()));

    match self.resolver.resolve(&self.def.secrets).await {
      Ok(secrets) => ctx.set_secrets(secrets),
      Err(e) => {
        error!(error = %e, "secret resolution failed");
        ctx.fail(e.to_string());
        StageRunner::skip_all(&self.def.stages, &mut ctx);
        return self.reporter.finalize(ctx).await;
      }
    }

    if let Err(e) =
      WorkspacePreparer::prepare(ctx.workspace(), &self.def.workspace.directories).await
    {
      error!(error = %e, "workspace preparation failed");
      ctx.fail(e.to_string());
      StageRunner::skip_all(&self.def.stages, &mut ctx);
      return self.reporter.finalize(ctx).await;
    }

    self.runner.run(&self.def.stages, &mut ctx, &cancel).await;
    self.reporter.finalize(ctx).await
  }

  /// Admit `event` and, if accepted, run it.
  pub async fn handle(
    &self,
    event: InboundEvent,
    cancel: CancellationToken,
  ) -> Result<RunReport, TriggerError> {
    let ctx = self.admit(event)?;
    Ok(self.execute(ctx, cancel).await)
  }

  fn build_reporter(&self) -> RunReporter {
    let reporter = RunReporter::new(self.def.hooks.clone())
      .remove_workspace(self.def.workspace.remove_on_finish)
      .inherit_env(self.def.inherit_env)
      .scrub_env(self.scrub_env.clone())
      .with_notifier(self.notifier.clone());
    match &self.config.runs_dir {
      Some(dir) => reporter.runs_dir(dir.clone()),
      None => reporter,
    }
  }
}

/// Every variable a declared credential could be read from or exported as.
fn credential_env_vars(def: &PipelineDef, backend: &dyn SecretsBackend) -> Vec<String> {
  let mut names: Vec<String> = def
    .secrets
    .iter()
    .flat_map(|secret| {
      let mut names = backend.env_sources(&secret.id);
      names.push(secret.env_var());
      names
    })
    .collect();
  names.sort();
  names.dedup();
  names
}
