use pipewright_trigger::TriggerError;

/// Errors raised by the run loops.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("pipeline runner channel closed")]
  ChannelClosed,

  #[error("pipeline '{0}' is not poll-triggered")]
  NotPollTriggered(String),

  #[error("failed to list watched bucket: {0}")]
  Storage(#[from] pipewright_storage::Error),

  #[error(transparent)]
  Trigger(#[from] TriggerError),
}
