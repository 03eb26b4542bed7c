//! Pipewright Engine
//!
//! Long-running drivers around a [`Pipeline`](pipewright_runtime::Pipeline).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       PipelineRunner                         │
//! │  - owns an mpsc channel of webhook payloads                  │
//! │  - admits each payload, runs it on its own task              │
//! │  - at most `max_concurrent_runs` runs at a time              │
//! └──────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Poller                             │
//! │  - lists the watched bucket on an interval                   │
//! │  - runs the oldest unseen object, then advances and          │
//! │    persists the watermark                                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let pipeline = Arc::new(Pipeline::new(def, config, store, secrets)?);
//! let runner = PipelineRunner::new(pipeline).with_max_concurrent_runs(4);
//!
//! // Hand the sender to whatever receives upload notifications.
//! let sender = runner.sender();
//!
//! let cancel = CancellationToken::new();
//! runner.start(cancel).await?;
//! ```

mod error;
mod poller;
mod runner;

pub use error::EngineError;
pub use poller::Poller;
pub use runner::PipelineRunner;
