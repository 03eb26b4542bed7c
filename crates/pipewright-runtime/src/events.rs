//! Execution events and notifiers for observability.
//!
//! Events are emitted as a run progresses so consumers can observe it,
//! persist state, stream to a dashboard, etc.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::RunStatus;
use crate::result::StageStatus;

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A run has started executing.
  RunStarted { run_id: String, pipeline_id: String },

  /// A stage has started.
  StageStarted { run_id: String, stage: String },

  /// A stage finished without failing the run.
  StageCompleted {
    run_id: String,
    stage: String,
    status: StageStatus,
  },

  /// A stage failed or timed out.
  StageFailed {
    run_id: String,
    stage: String,
    status: StageStatus,
    error: String,
  },

  /// The run has been finalized.
  RunFinished {
    run_id: String,
    status: RunStatus,
    message: String,
  },
}

/// Trait for receiving execution events.
///
/// The runtime calls `notify` for each event; implementations decide what
/// to do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a run; volume is a handful of
  // events per stage.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
