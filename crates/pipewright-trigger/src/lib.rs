//! Pipewright Trigger
//!
//! Turns inbound signals into validated [`TriggerEvent`]s. A pipeline is
//! triggered in one of two modes:
//!
//! - **webhook**: an upload notification names the bucket and object key;
//! - **poll**: a bucket listing is compared against a monotonic
//!   [`Watermark`] (modification time, then key) and the oldest unseen
//!   object is picked.
//!
//! Validation happens here; allocating a run for an admitted event is the
//! runtime's job.

mod error;
mod types;
mod watermark;
mod webhook;

pub use error::TriggerError;
pub use types::{InboundEvent, TriggerEvent, TriggerMode, select_changed};
pub use watermark::{Position, Watermark};
pub use webhook::parse_webhook;
