//! Template value types for stage configuration.
//!
//! Exec arguments, environment values and cleanup paths are template strings
//! rendered by minijinja when the stage runs. The context exposes the run's
//! identity and its trigger event.
//!
//! # Examples
//!
//! ```json
//! {
//!   "MONGO_COLLECTION": "{{ machine }}",
//!   "SOURCE_OBJECT": "{{ source }}/{{ key }}",
//!   "REQUESTED_BY": "{{ fields.user | default('unknown') }}",
//!   "MONGO_DB": "log_analysis_db"
//! }
//! ```

/// A template string that gets rendered against the run context at runtime.
pub type InputValue = String;
