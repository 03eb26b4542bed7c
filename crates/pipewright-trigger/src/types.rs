use std::collections::BTreeMap;

use pipewright_config::TriggerDef;
use pipewright_storage::ObjectInfo;
use serde::{Deserialize, Serialize};

use crate::watermark::Position;

/// The admission mode of a pipeline's trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerMode {
  Webhook,
  Poll { bucket: String, prefix: String },
}

impl From<&TriggerDef> for TriggerMode {
  fn from(def: &TriggerDef) -> Self {
    match def {
      TriggerDef::Webhook => TriggerMode::Webhook,
      TriggerDef::Poll { bucket, prefix, .. } => TriggerMode::Poll {
        bucket: bucket.clone(),
        prefix: prefix.clone(),
      },
    }
  }
}

impl TriggerMode {
  pub fn name(&self) -> &'static str {
    match self {
      TriggerMode::Webhook => "webhook",
      TriggerMode::Poll { .. } => "poll",
    }
  }
}

/// An inbound signal, before validation.
#[derive(Debug, Clone)]
pub enum InboundEvent {
  /// A pushed notification payload.
  Webhook(serde_json::Value),
  /// A periodic poll, carrying the current listing of the watched bucket.
  Poll(Vec<ObjectInfo>),
}

impl InboundEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      InboundEvent::Webhook(_) => "webhook",
      InboundEvent::Poll(_) => "poll",
    }
  }
}

/// A validated trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
  /// Bucket (or other source identifier) holding the object.
  pub source: String,
  /// Key of the uploaded object.
  pub key: String,
  /// Any other fields the notification carried, uninterpreted.
  #[serde(default)]
  pub fields: BTreeMap<String, String>,
  /// For polled events, the position that advances the watermark.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub watermark: Option<Position>,
}

impl TriggerEvent {
  pub fn new(source: impl Into<String>, key: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      key: key.into(),
      fields: BTreeMap::new(),
      watermark: None,
    }
  }

  /// Build the event for a polled object.
  pub fn from_object(bucket: &str, object: &ObjectInfo) -> Self {
    let mut fields = BTreeMap::new();
    fields.insert("size".to_string(), object.size.to_string());
    fields.insert("last_modified".to_string(), object.last_modified.to_string());

    Self {
      source: bucket.to_string(),
      key: object.key.clone(),
      fields,
      watermark: Some(Position::new(object.last_modified, object.key.clone())),
    }
  }

  /// The event as a flat field map: `bucket`, `key`, then the extra fields.
  pub fn to_map(&self) -> BTreeMap<String, String> {
    let mut map = self.fields.clone();
    map.insert("bucket".to_string(), self.source.clone());
    map.insert("key".to_string(), self.key.clone());
    map
  }
}

/// Pick the oldest object past `watermark`, ordering by modification time
/// and then by key.
///
/// Taking the oldest rather than the newest lets successive polls walk
/// forward through a backlog without skipping uploads, including uploads
/// that share a timestamp.
pub fn select_changed<'a>(objects: &'a [ObjectInfo], watermark: &Position) -> Option<&'a ObjectInfo> {
  let after = |o: &ObjectInfo| {
    (o.last_modified, o.key.as_str()) > (watermark.last_modified, watermark.key.as_str())
  };
  objects.iter().filter(|o| after(o)).min_by(|a, b| {
    a.last_modified
      .cmp(&b.last_modified)
      .then_with(|| a.key.cmp(&b.key))
  })
}
