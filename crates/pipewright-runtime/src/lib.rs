//! Pipewright Runtime
//!
//! This crate runs pipelines. A [`Pipeline`] owns a validated definition and
//! takes each admitted event through one run:
//!
//! ```text
//! TriggerListener::admit ─► SecretResolver ─► WorkspacePreparer
//!        │                                          │
//!        ▼                                          ▼
//!   RunContext ───────────────────────────────► StageRunner
//!                                    fetch, extract, exec, remove, package
//!                                                   │
//!                                                   ▼
//!                                     RunReporter::finalize ─► RunReport
//! ```
//!
//! Stages run strictly in order. The first failure of a stage that is not
//! best-effort fails the run; later stages are skipped unless flagged
//! `run_always`. A global timeout or cancellation kills the in-flight
//! process and stops the run.

mod context;
mod error;
mod events;
mod fetch;
mod fs_ops;
mod listener;
mod pipeline;
mod process;
mod reporter;
mod result;
mod stage;
mod template;
mod workspace;

pub use context::{RunContext, RunStatus};
pub use error::{FetchError, RuntimeError, WorkspaceError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use fetch::ObjectFetcher;
pub use listener::TriggerListener;
pub use pipeline::{Pipeline, RuntimeConfig};
pub use reporter::RunReporter;
pub use result::{RunReport, StageResult, StageStatus};
pub use stage::StageRunner;
pub use template::sanitize_machine_name;
pub use workspace::WorkspacePreparer;
