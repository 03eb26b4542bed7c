use std::path::PathBuf;
use std::sync::Arc;

use pipewright_storage::{ObjectInfo, validate_key};
use pipewright_trigger::{
  InboundEvent, TriggerError, TriggerEvent, TriggerMode, Watermark, parse_webhook, select_changed,
};
use tracing::{debug, info};

use crate::context::RunContext;

/// Admits inbound events for one pipeline.
///
/// Admission validates the event and allocates a run with a fresh id and
/// workspace path. It never executes anything and never touches the
/// watermark: that is advanced once the run has been finalized.
pub struct TriggerListener {
  pipeline_id: String,
  mode: TriggerMode,
  workspace_base: PathBuf,
  watermark: Arc<Watermark>,
}

impl TriggerListener {
  pub fn new(pipeline_id: impl Into<String>, mode: TriggerMode, workspace_base: impl Into<PathBuf>) -> Self {
    Self {
      pipeline_id: pipeline_id.into(),
      mode,
      workspace_base: workspace_base.into(),
      watermark: Arc::new(Watermark::default()),
    }
  }

  pub fn with_watermark(mut self, watermark: Arc<Watermark>) -> Self {
    self.watermark = watermark;
    self
  }

  pub fn watermark(&self) -> &Arc<Watermark> {
    &self.watermark
  }

  pub fn mode(&self) -> &TriggerMode {
    &self.mode
  }

  /// Validate `event` and allocate a run for it.
  pub fn admit(&self, event: InboundEvent) -> Result<RunContext, TriggerError> {
    let trigger = match (&self.mode, event) {
      (TriggerMode::Webhook, InboundEvent::Webhook(payload)) => parse_webhook(&payload)?,
      (TriggerMode::Poll { bucket, prefix }, InboundEvent::Poll(listing)) => {
        self.pick(bucket, prefix, &listing)?
      }
      (mode, event) => {
        return Err(TriggerError::ModeMismatch {
          expected: mode.name(),
          received: event.kind(),
        });
      }
    };

    validate_key(&trigger.key).map_err(|e| TriggerError::Validation {
      field: "key".to_string(),
      reason: e.to_string(),
    })?;

    let ctx = RunContext::new(self.pipeline_id.clone(), trigger, &self.workspace_base);
    info!(
      pipeline_id = %self.pipeline_id,
      run_id = %ctx.run_id(),
      mode = self.mode.name(),
      bucket = %ctx.event().source,
      key = %ctx.event().key,
      "run_admitted"
    );
    Ok(ctx)
  }

  fn pick(&self, bucket: &str, prefix: &str, listing: &[ObjectInfo]) -> Result<TriggerEvent, TriggerError> {
    let candidates: Vec<ObjectInfo> = listing
      .iter()
      .filter(|o| o.key.starts_with(prefix))
      .cloned()
      .collect();
    let watermark = self.watermark.current();

    match select_changed(&candidates, &watermark) {
      Some(object) => Ok(TriggerEvent::from_object(bucket, object)),
      None => {
        debug!(bucket = %bucket, listed = listing.len(), watermark = %watermark, "poll found nothing new");
        Err(TriggerError::Unchanged {
          bucket: bucket.to_string(),
          watermark,
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pipewright_trigger::Position;
  use serde_json::json;

  fn object(key: &str, last_modified: u64) -> ObjectInfo {
    ObjectInfo {
      key: key.to_string(),
      size: 1,
      last_modified,
    }
  }

  fn poll_listener(watermark: Position) -> TriggerListener {
    TriggerListener::new(
      "logs",
      TriggerMode::Poll {
        bucket: "uploads".to_string(),
        prefix: "incoming/".to_string(),
      },
      "/tmp/pipewright-test",
    )
    .with_watermark(Arc::new(Watermark::new(watermark)))
  }

  #[test]
  fn test_admit_webhook() {
    let listener = TriggerListener::new("logs", TriggerMode::Webhook, "/data/ws");
    let ctx = listener
      .admit(InboundEvent::Webhook(json!({"bucket": "uploads", "key": "m1/logs.tar"})))
      .unwrap();

    assert_eq!(ctx.pipeline_id(), "logs");
    assert_eq!(ctx.event().source, "uploads");
    assert_eq!(ctx.event().key, "m1/logs.tar");
    assert_eq!(ctx.workspace(), PathBuf::from("/data/ws").join(ctx.run_id()));
  }

  #[test]
  fn test_admit_webhook_missing_key() {
    let listener = TriggerListener::new("logs", TriggerMode::Webhook, "/data/ws");
    let err = listener
      .admit(InboundEvent::Webhook(json!({"bucket": "uploads"})))
      .unwrap_err();
    assert!(matches!(err, TriggerError::Validation { ref field, .. } if field == "key"));
  }

  #[test]
  fn test_admit_allocates_distinct_runs() {
    let listener = TriggerListener::new("logs", TriggerMode::Webhook, "/data/ws");
    let payload = json!({"bucket": "uploads", "key": "a.tar"});
    let a = listener.admit(InboundEvent::Webhook(payload.clone())).unwrap();
    let b = listener.admit(InboundEvent::Webhook(payload)).unwrap();
    assert_ne!(a.run_id(), b.run_id());
    assert_ne!(a.workspace(), b.workspace());
  }

  #[test]
  fn test_admit_poll_filters_prefix() {
    let listener = poll_listener(Position::default());
    let ctx = listener
      .admit(InboundEvent::Poll(vec![
        object("other/old.tar", 10),
        object("incoming/b.tar", 30),
        object("incoming/a.tar", 20),
      ]))
      .unwrap();

    assert_eq!(ctx.event().source, "uploads");
    assert_eq!(ctx.event().key, "incoming/a.tar");
    assert_eq!(ctx.event().watermark, Some(Position::new(20, "incoming/a.tar")));
    // Admission alone never moves the watermark.
    assert_eq!(listener.watermark().current(), Position::default());
  }

  #[test]
  fn test_admit_poll_unchanged() {
    let listener = poll_listener(Position::new(30, "incoming/a.tar"));
    let err = listener
      .admit(InboundEvent::Poll(vec![object("incoming/a.tar", 30)]))
      .unwrap_err();
    assert!(matches!(err, TriggerError::Unchanged { ref watermark, .. } if watermark.last_modified == 30));

    // A different key at the same time is still new.
    let ctx = listener
      .admit(InboundEvent::Poll(vec![
        object("incoming/a.tar", 30),
        object("incoming/b.tar", 30),
      ]))
      .unwrap();
    assert_eq!(ctx.event().key, "incoming/b.tar");
  }

  #[test]
  fn test_admit_mode_mismatch() {
    let listener = poll_listener(Position::default());
    let err = listener
      .admit(InboundEvent::Webhook(json!({"bucket": "b", "key": "k"})))
      .unwrap_err();
    assert!(matches!(
      err,
      TriggerError::ModeMismatch {
        expected: "poll",
        received: "webhook"
      }
    ));
  }
}
