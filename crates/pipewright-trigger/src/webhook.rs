//! Webhook payload parsing.
//!
//! Two payload shapes are accepted:
//!
//! ```json
//! { "bucket": "logs", "key": "m1/data.tar", "requested_by": "ci" }
//! ```
//!
//! and S3-style bucket notifications as sent by MinIO:
//!
//! ```json
//! { "EventName": "s3:ObjectCreated:Put",
//!   "Records": [{ "eventName": "s3:ObjectCreated:Put",
//!                 "s3": { "bucket": { "name": "logs" },
//!                         "object": { "key": "m1%2Fdata.tar", "size": 1024 } } }] }
//! ```

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use pipewright_storage::validate_key;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TriggerError;
use crate::types::TriggerEvent;

const SOURCE_FIELDS: &[&str] = &["bucket", "source"];
const KEY_FIELDS: &[&str] = &["key", "object_key", "object"];

/// Validate a webhook payload and extract the trigger event.
pub fn parse_webhook(payload: &Value) -> Result<TriggerEvent, TriggerError> {
  let object = payload
    .as_object()
    .ok_or_else(|| TriggerError::validation("payload", "must be a JSON object"))?;

  let event = match object.get("Records") {
    Some(records) => parse_notification(object, records)?,
    None => parse_flat(object)?,
  };

  validate_key(&event.key)
    .map_err(|_| TriggerError::validation("key", "is not a valid object key"))?;

  debug!(bucket = %event.source, key = %event.key, "webhook payload accepted");
  Ok(event)
}

fn parse_flat(object: &Map<String, Value>) -> Result<TriggerEvent, TriggerError> {
  let source = required_string(object, SOURCE_FIELDS, "bucket")?;
  let key = required_string(object, KEY_FIELDS, "key")?;

  let fields = object
    .iter()
    .filter(|(name, _)| !SOURCE_FIELDS.contains(&name.as_str()) && !KEY_FIELDS.contains(&name.as_str()))
    .map(|(name, value)| (name.clone(), field_string(value)))
    .collect();

  Ok(TriggerEvent {
    source,
    key,
    fields,
    watermark: None,
  })
}

fn parse_notification(
  object: &Map<String, Value>,
  records: &Value,
) -> Result<TriggerEvent, TriggerError> {
  let record = records
    .as_array()
    .and_then(|r| r.first())
    .ok_or_else(|| TriggerError::validation("Records", "must contain at least one record"))?;

  let source = record
    .pointer("/s3/bucket/name")
    .ok_or_else(|| TriggerError::validation("bucket", "is missing"))
    .and_then(|v| non_empty_string(v, "bucket"))?;

  let raw_key = record
    .pointer("/s3/object/key")
    .ok_or_else(|| TriggerError::validation("key", "is missing"))
    .and_then(|v| non_empty_string(v, "key"))?;
  let key = decode_key(&raw_key)?;

  let mut fields = BTreeMap::new();
  for (name, value) in object {
    if name != "Records" {
      fields.insert(name.clone(), field_string(value));
    }
  }
  for (name, pointer) in [
    ("event_name", "/eventName"),
    ("event_time", "/eventTime"),
    ("size", "/s3/object/size"),
    ("etag", "/s3/object/eTag"),
  ] {
    if let Some(value) = record.pointer(pointer) {
      fields.insert(name.to_string(), field_string(value));
    }
  }

  Ok(TriggerEvent {
    source,
    key,
    fields,
    watermark: None,
  })
}

/// First present alias wins.
fn required_string(
  object: &Map<String, Value>,
  aliases: &[&str],
  field: &str,
) -> Result<String, TriggerError> {
  let value = aliases
    .iter()
    .find_map(|alias| object.get(*alias))
    .ok_or_else(|| TriggerError::validation(field, "is missing"))?;
  non_empty_string(value, field)
}

fn non_empty_string(value: &Value, field: &str) -> Result<String, TriggerError> {
  match value {
    Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
    Value::String(_) => Err(TriggerError::validation(field, "is empty")),
    _ => Err(TriggerError::validation(field, "must be a string")),
  }
}

fn field_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Object keys in bucket notifications are URL-encoded, with `+` for spaces.
fn decode_key(raw: &str) -> Result<String, TriggerError> {
  let spaced = raw.replace('+', " ");
  percent_decode_str(&spaced)
    .decode_utf8()
    .map(|k| k.into_owned())
    .map_err(|_| TriggerError::validation("key", "is not valid UTF-8 after decoding"))
}
