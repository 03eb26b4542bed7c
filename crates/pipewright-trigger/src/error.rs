use crate::watermark::Position;

/// Error type for trigger admission.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
  /// The event is missing a required field or the field is malformed.
  #[error("invalid trigger event: field '{field}' {reason}")]
  Validation { field: String, reason: String },

  /// A poll found nothing newer than the watermark.
  #[error("no new objects in '{bucket}' since {watermark}")]
  Unchanged { bucket: String, watermark: Position },

  /// The event kind does not match the pipeline's trigger mode.
  #[error("{received} event received by a {expected}-triggered pipeline")]
  ModeMismatch {
    expected: &'static str,
    received: &'static str,
  },

  /// Watermark state could not be read or written.
  #[error("watermark persistence failed: {0}")]
  Persistence(String),
}

impl TriggerError {
  pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.into(),
    }
  }
}
