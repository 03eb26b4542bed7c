//! Pipeline runner with channel-based triggering.
//!
//! The `PipelineRunner` owns an mpsc channel for receiving webhook payloads
//! and runs each admitted event through the `Pipeline`.

use std::sync::Arc;

use pipewright_runtime::{Pipeline, RunReport};
use pipewright_trigger::InboundEvent;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;

/// A runner that executes a pipeline in response to webhook payloads.
///
/// # Usage
///
/// ```ignore
/// let runner = PipelineRunner::new(pipeline);
///
/// // Get sender for upload notifications
/// let sender = runner.sender();
///
/// // Start the execution loop
/// let cancel = CancellationToken::new();
/// runner.start(cancel).await?;
/// ```
pub struct PipelineRunner {
  sender: mpsc::Sender<serde_json::Value>,
  receiver: mpsc::Receiver<serde_json::Value>,
  pipeline: Arc<Pipeline>,
  max_concurrent_runs: usize,
  reports: Option<mpsc::UnboundedSender<RunReport>>,
}

impl PipelineRunner {
  pub fn new(pipeline: Arc<Pipeline>) -> Self {
    Self::with_buffer_size(pipeline, 100)
  }

  /// Create a runner with a custom channel buffer size.
  pub fn with_buffer_size(pipeline: Arc<Pipeline>, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    Self {
      sender,
      receiver,
      pipeline,
      max_concurrent_runs: 1,
      reports: None,
    }
  }

  /// Allow up to `max` runs at once. Zero is treated as one.
  pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
    self.max_concurrent_runs = max.max(1);
    self
  }

  /// Forward every finished run's report to `sender`.
  pub fn with_reports(mut self, sender: mpsc::UnboundedSender<RunReport>) -> Self {
    self.reports = Some(sender);
    self
  }

  /// Get a sender handle for triggering runs.
  pub fn sender(&self) -> mpsc::Sender<serde_json::Value> {
    self.sender.clone()
  }

  /// Queue a payload for execution.
  pub async fn run(&self, payload: serde_json::Value) -> Result<(), EngineError> {
    self
      .sender
      .send(payload)
      .await
      .map_err(|_| EngineError::ChannelClosed)
  }

  /// Start the execution loop.
  ///
  /// Runs until the cancellation token is triggered or every sender is
  /// dropped, then waits for the runs still in flight. Cancelling the token
  /// also cancels those runs.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), EngineError> {
    let Self {
      sender,
      mut receiver,
      pipeline,
      max_concurrent_runs,
      reports,
    } = self;
    // Only external senders keep the channel open.
    drop(sender);

    let pipeline_id = pipeline.def().pipeline_id.clone();
    info!(
      pipeline_id = %pipeline_id,
      max_concurrent_runs,
      "starting pipeline runner"
    );

    let permits = Arc::new(Semaphore::new(max_concurrent_runs));
    let mut runs = JoinSet::new();

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(pipeline_id = %pipeline_id, "pipeline runner cancelled");
          break;
        }
        Some(finished) = runs.join_next(), if !runs.is_empty() => {
          collect(finished, reports.as_ref());
        }
        payload = receiver.recv() => {
          let Some(payload) = payload else {
            info!(pipeline_id = %pipeline_id, "pipeline runner channel closed");
            break;
          };

          let ctx = match pipeline.admit(InboundEvent::Webhook(payload)) {
            Ok(ctx) => ctx,
            Err(e) => {
              warn!(pipeline_id = %pipeline_id, error = %e, "event_rejected");
              continue;
            }
          };

          let permit = tokio::select! {
            _ = cancel.cancelled() => {
              warn!(run_id = %ctx.run_id(), "runner cancelled before admitted run could start");
              break;
            }
            permit = permits.clone().acquire_owned() => match permit {
              Ok(permit) => permit,
              Err(_) => break,
            },
          };

          let pipeline = pipeline.clone();
          let run_cancel = cancel.child_token();
          runs.spawn(async move {
            let report = pipeline.execute(ctx, run_cancel).await;
            drop(permit);
            report
          });
        }
      }
    }

    if !runs.is_empty() {
      info!(pipeline_id = %pipeline_id, in_flight = runs.len(), "waiting for in-flight runs");
    }
    while let Some(finished) = runs.join_next().await {
      collect(finished, reports.as_ref());
    }

    Ok(())
  }

  /// Admit and run a single payload, without the loop.
  pub async fn execute_once(
    &self,
    payload: serde_json::Value,
    cancel: CancellationToken,
  ) -> Result<RunReport, EngineError> {
    Ok(
      self
        .pipeline
        .handle(InboundEvent::Webhook(payload), cancel)
        .await?,
    )
  }

  pub fn pipeline(&self) -> &Pipeline {
    &self.pipeline
  }
}

fn collect(
  finished: Result<RunReport, JoinError>,
  reports: Option<&mpsc::UnboundedSender<RunReport>>,
) {
  match finished {
    Ok(report) => {
      info!(
        run_id = %report.run_id,
        status = report.status.as_str(),
        "run_completed"
      );
      if let Some(reports) = reports {
        let _ = reports.send(report);
      }
    }
    Err(e) => error!(error = %e, "run task panicked"),
  }
}
