//! Pipewright Config
//!
//! This crate contains the serializable pipeline configuration types for
//! pipewright. These types represent a pipeline definition before it is
//! loaded by the runtime.
//!
//! Configuration is loaded from JSON files (via the CLI with
//! `--pipeline=pipeline.json`). [`PipelineDef::from_json`] parses and
//! validates a definition in one step; the runtime only ever sees validated
//! definitions.

mod enums;
mod error;
mod input;
mod pipeline;
mod secret;
mod stage;

pub use enums::{StageCategory, TriggerDef};
pub use error::ConfigError;
pub use input::InputValue;
pub use pipeline::{HookDef, HooksDef, PackageDef, PipelineDef, WorkspaceDef};
pub use secret::SecretRef;
pub use stage::{StageDef, StageKind};
