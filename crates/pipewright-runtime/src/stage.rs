//! Ordered stage execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use minijinja::Environment;
use pipewright_artifact::{Artifact, ArtifactPackager};
use pipewright_config::{PipelineDef, StageCategory, StageDef, StageKind};
use pipewright_storage::{ByteStream, Error as StorageError, ObjectStore};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use crate::context::{RunContext, RunStatus};
use crate::error::RuntimeError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::fetch::ObjectFetcher;
use crate::fs_ops;
use crate::process::{self, ProcessSpec};
use crate::result::{StageResult, StageStatus};
use crate::template;
use crate::workspace::resolve_within;

/// How a started stage ended.
enum Outcome {
  Finished(Result<StageOutput, RuntimeError>),
  TimedOut { global: bool },
  Cancelled,
}

#[derive(Default)]
struct StageOutput {
  exit_code: Option<i32>,
  artifact: Option<Artifact>,
}

/// Runs a pipeline's stages, strictly in order, against one run.
pub struct StageRunner {
  pipeline: Arc<PipelineDef>,
  store: Arc<dyn ObjectStore>,
  fetcher: ObjectFetcher,
  packager: ArtifactPackager,
  artifact_dir: PathBuf,
  templates: Environment<'static>,
  scrub_env: Vec<String>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl StageRunner {
  /// Bundles are written to `artifact_dir`, which should live outside any
  /// workspace.
  pub fn new(pipeline: Arc<PipelineDef>, store: Arc<dyn ObjectStore>, artifact_dir: PathBuf) -> Self {
    Self {
      packager: ArtifactPackager::new(pipeline.pipeline_id.clone()),
      fetcher: ObjectFetcher::new(store.clone()),
      pipeline,
      store,
      artifact_dir,
      templates: template::environment(),
      scrub_env: Vec::new(),
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Never pass these inherited variables on to exec stages. Declared
  /// credentials still reach them through the run's secret set.
  pub fn with_scrubbed_env(mut self, names: Vec<String>) -> Self {
    self.scrub_env = names;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Run `stages` in order, appending each result to the context log.
  ///
  /// After the first failure of a stage that is not best-effort the run is
  /// failed and later stages are skipped, except those flagged `run_always`.
  /// After a global timeout or cancellation every remaining stage is skipped.
  /// Returns the results recorded by this call.
  #[instrument(name = "stage_runner", skip_all, fields(run_id = %ctx.run_id()))]
  pub async fn run(
    &self,
    stages: &[StageDef],
    ctx: &mut RunContext,
    cancel: &CancellationToken,
  ) -> Vec<StageResult> {
    let first = ctx.log().len();
    if ctx.remaining().is_none() {
      ctx.start_clock(Duration::from_millis(self.pipeline.timeout_ms()));
    }

    let mut halted = false;
    let mut fetch_failed = false;
    for stage in stages {
      // Nothing external ever runs against a workspace whose input never arrived.
      let blocked = fetch_failed && stage.category() == StageCategory::External;
      if halted || blocked || (ctx.status() == RunStatus::Failure && !stage.runs_always()) {
        info!(stage = %stage.name, "stage_skipped");
        ctx.record(StageResult::skipped(&stage.name, stage.category()));
        continue;
      }

      if cancel.is_cancelled() {
        warn!(stage = %stage.name, "run cancelled before stage start");
        ctx.fail("run cancelled");
        halted = true;
        ctx.record(StageResult::skipped(&stage.name, stage.category()));
        continue;
      }

      let remaining = ctx.remaining().unwrap_or_default();
      if remaining.is_zero() {
        ctx.fail(self.global_timeout_message());
        halted = true;
        ctx.record(StageResult::skipped(&stage.name, stage.category()));
        continue;
      }

      halted = self.run_stage(stage, ctx, cancel, remaining).await;
      if matches!(stage.kind, StageKind::Fetch { .. })
        && ctx.log().last().is_some_and(|r| r.status != StageStatus::Ok)
      {
        fetch_failed = true;
      }
    }

    ctx.log()[first..].to_vec()
  }

  /// Record every stage as skipped, for runs that fail before any stage.
  pub(crate) fn skip_all(stages: &[StageDef], ctx: &mut RunContext) {
    for stage in stages {
      ctx.record(StageResult::skipped(&stage.name, stage.category()));
    }
  }

  /// Run one stage under its time limit. Returns whether the run must stop.
  async fn run_stage(
    &self,
    stage: &StageDef,
    ctx: &mut RunContext,
    cancel: &CancellationToken,
    remaining: Duration,
  ) -> bool {
    let (limit, global) = match stage.timeout_ms.map(Duration::from_millis) {
      Some(timeout) if timeout < remaining => (timeout, false),
      _ => (remaining, true),
    };

    let run_id = ctx.run_id().to_string();
    let span = info_span!("stage", stage = %stage.name, index = ctx.stage_index());
    self.notifier.notify(ExecutionEvent::StageStarted {
      run_id: run_id.clone(),
      stage: stage.name.clone(),
    });
    span.in_scope(|| info!(category = ?stage.category(), limit_ms = limit.as_millis() as u64, "stage_started"));

    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = {
      let ctx: &RunContext = ctx;
      tokio::select! {
        result = self.execute(stage, ctx).instrument(span.clone()) => Outcome::Finished(result),
        _ = tokio::time::sleep(limit) => Outcome::TimedOut { global },
        _ = cancel.cancelled() => Outcome::Cancelled,
      }
    };

    let mut result = StageResult {
      stage: stage.name.clone(),
      category: stage.category(),
      status: StageStatus::Ok,
      exit_code: None,
      error: None,
      started_at: Some(started_at),
      duration_ms: clock.elapsed().as_millis() as u64,
    };
    let mut halted = false;

    match outcome {
      Outcome::Finished(Ok(output)) => {
        result.exit_code = output.exit_code;
        if let Some(artifact) = output.artifact {
          ctx.set_artifact(artifact);
        }
        span.in_scope(|| info!(duration_ms = result.duration_ms, "stage_completed"));
      }
      Outcome::Finished(Err(e)) => {
        let message = ctx.secrets().redact(&e.to_string()).into_owned();
        result.status = StageStatus::Failed;
        result.exit_code = e.exit_code();
        result.error = Some(message.clone());

        if stage.is_best_effort() {
          span.in_scope(|| warn!(error = %message, "stage_failed (best effort, continuing)"));
        } else {
          span.in_scope(|| error!(error = %message, "stage_failed"));
          ctx.fail(message);
        }
      }
      Outcome::TimedOut { global } => {
        let message = RuntimeError::Timeout {
          stage: stage.name.clone(),
          timeout_ms: limit.as_millis() as u64,
        }
        .to_string();
        result.status = StageStatus::TimedOut;
        result.error = Some(message.clone());
        span.in_scope(|| error!(error = %message, global, "stage_timed_out"));

        if global {
          ctx.fail(self.global_timeout_message());
          halted = true;
        } else if !stage.is_best_effort() {
          ctx.fail(message);
        }
      }
      Outcome::Cancelled => {
        result.status = StageStatus::Failed;
        result.error = Some(RuntimeError::Cancelled.to_string());
        span.in_scope(|| warn!("stage_cancelled"));
        ctx.fail("run cancelled");
        halted = true;
      }
    }

    let event = match (&result.status, &result.error) {
      (StageStatus::Ok, _) | (_, None) => ExecutionEvent::StageCompleted {
        run_id,
        stage: stage.name.clone(),
        status: result.status,
      },
      (status, Some(error)) => ExecutionEvent::StageFailed {
        run_id,
        stage: stage.name.clone(),
        status: *status,
        error: error.clone(),
      },
    };
    self.notifier.notify(event);
    ctx.record(result);

    halted
  }

  async fn execute(&self, stage: &StageDef, ctx: &RunContext) -> Result<StageOutput, RuntimeError> {
    match &stage.kind {
      StageKind::Fetch { destination } => {
        let dir = resolve_within(ctx.workspace(), destination)?;
        let event = ctx.event();
        self.fetcher.fetch(&event.source, &event.key, &dir).await?;
        Ok(StageOutput::default())
      }
      StageKind::Extract { dir } => {
        fs_ops::extract(ctx.workspace(), dir).await?;
        Ok(StageOutput::default())
      }
      StageKind::Exec { command, args, env } => {
        let values = template::context_for(ctx);
        let args = args
          .iter()
          .map(|arg| template::render(&self.templates, &stage.name, arg, &values))
          .collect::<Result<Vec<_>, _>>()?;

        let mut vars = template::render_map(&self.templates, &stage.name, &self.pipeline.env, &values)?;
        vars.extend(template::render_map(&self.templates, &stage.name, env, &values)?);
        vars.push(("PIPEWRIGHT_RUN_ID".to_string(), ctx.run_id().to_string()));
        vars.push((
          "PIPEWRIGHT_WORKSPACE".to_string(),
          ctx.workspace().display().to_string(),
        ));

        let spec = ProcessSpec {
          name: &stage.name,
          program: command,
          args,
          env: vars,
          inherit_env: self.pipeline.inherit_env,
          scrub_env: &self.scrub_env,
          cwd: Some(ctx.workspace()),
        };
        let code = process::run(spec, ctx.secrets()).await?;
        Ok(StageOutput {
          exit_code: Some(code),
          artifact: None,
        })
      }
      StageKind::Remove { path } => {
        let values = template::context_for(ctx);
        let path = template::render(&self.templates, &stage.name, path, &values)?;
        fs_ops::remove(ctx.workspace(), &path).await?;
        Ok(StageOutput::default())
      }
      StageKind::Package => {
        let artifact = self
          .packager
          .package(
            ctx.workspace(),
            &self.pipeline.package.output_dirs,
            &self.artifact_dir,
          )
          .await?;
        if let Some(bucket) = &self.pipeline.package.publish_bucket {
          self.publish(bucket, &artifact).await?;
        }
        Ok(StageOutput {
          exit_code: None,
          artifact: Some(artifact),
        })
      }
    }
  }

  async fn publish(&self, bucket: &str, artifact: &Artifact) -> Result<(), RuntimeError> {
    let file = tokio::fs::File::open(&artifact.path)
      .await
      .map_err(|e| RuntimeError::Publish(StorageError::Io(e)))?;
    let stream: ByteStream = Box::pin(ReaderStream::new(file).map_err(StorageError::Io));

    self
      .store
      .put(bucket, &artifact.name, stream)
      .await
      .map_err(RuntimeError::Publish)?;

    info!(bucket = %bucket, key = %artifact.name, "artifact_published");
    Ok(())
  }

  fn global_timeout_message(&self) -> String {
    format!(
      "run exceeded global timeout of {} ms",
      self.pipeline.timeout_ms()
    )
  }
}
