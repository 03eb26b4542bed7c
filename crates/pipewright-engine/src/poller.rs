//! Poll-mode driver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipewright_config::TriggerDef;
use pipewright_runtime::{Pipeline, RunReport};
use pipewright_storage::ObjectStore;
use pipewright_trigger::{InboundEvent, Position, TriggerError, Watermark};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;

/// Lists a bucket on an interval and runs each new object, oldest first.
///
/// Runs are strictly sequential. The watermark moves forward once a run has
/// been finalized, whatever its status, so a bad object is never retried
/// forever. A cancelled run leaves it where it was: that object is taken
/// again on the next start.
pub struct Poller {
  pipeline: Arc<Pipeline>,
  store: Arc<dyn ObjectStore>,
  bucket: String,
  prefix: String,
  interval: Duration,
  watermark: Arc<Watermark>,
  state_path: Option<PathBuf>,
}

impl Poller {
  pub fn new(pipeline: Arc<Pipeline>, store: Arc<dyn ObjectStore>) -> Result<Self, EngineError> {
    let TriggerDef::Poll {
      bucket,
      prefix,
      interval_ms,
    } = pipeline.def().trigger.clone()
    else {
      return Err(EngineError::NotPollTriggered(
        pipeline.def().pipeline_id.clone(),
      ));
    };

    Ok(Self {
      watermark: pipeline.listener().watermark().clone(),
      pipeline,
      store,
      bucket,
      prefix,
      interval: Duration::from_millis(interval_ms),
      state_path: None,
    })
  }

  /// Persist the watermark to `path` after every run and restore it on start.
  pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.state_path = Some(path.into());
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn watermark(&self) -> Position {
    self.watermark.current()
  }

  /// Restore the persisted watermark, if any.
  pub async fn load_state(&self) -> Result<(), EngineError> {
    if let Some(path) = &self.state_path {
      let stored = Watermark::load(path).await?;
      self.watermark.advance(stored.current());
      info!(watermark = %self.watermark.current(), path = %path.display(), "watermark_loaded");
    }
    Ok(())
  }

  /// List the bucket once and run the oldest unseen object, if there is one.
  #[instrument(name = "poll", skip_all, fields(bucket = %self.bucket))]
  pub async fn poll_once(&self, cancel: CancellationToken) -> Result<Option<RunReport>, EngineError> {
    let listing = self.store.list(&self.bucket, &self.prefix).await?;
    debug!(objects = listing.len(), "bucket listed");

    let report = match self
      .pipeline
      .handle(InboundEvent::Poll(listing), cancel.clone())
      .await
    {
      Ok(report) => report,
      Err(TriggerError::Unchanged { .. }) => return Ok(None),
      Err(e) => return Err(e.into()),
    };

    if cancel.is_cancelled() && !report.is_success() {
      warn!(run_id = %report.run_id, "run cancelled, watermark held");
      return Ok(Some(report));
    }

    let advanced = report
      .watermark
      .clone()
      .is_some_and(|position| self.watermark.advance(position));
    if advanced {
      info!(watermark = %self.watermark.current(), "watermark_advanced");
      if let Some(path) = &self.state_path {
        self.watermark.persist(path).await?;
      }
    }

    Ok(Some(report))
  }

  /// Poll until cancelled. Each tick drains the backlog one object at a time.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), EngineError> {
    self.load_state().await?;
    info!(
      pipeline_id = %self.pipeline.def().pipeline_id,
      bucket = %self.bucket,
      prefix = %self.prefix,
      interval_ms = self.interval.as_millis() as u64,
      watermark = %self.watermark.current(),
      "starting poller"
    );

    let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("poller cancelled");
          break;
        }
        _ = ticker.tick() => {
          while !cancel.is_cancelled() {
            match self.poll_once(cancel.child_token()).await {
              Ok(Some(report)) => {
                info!(run_id = %report.run_id, status = report.status.as_str(), "run_completed");
              }
              Ok(None) => break,
              Err(e) => {
                warn!(error = %e, "poll_failed");
                break;
              }
            }
          }
        }
      }
    }

    Ok(())
  }
}
