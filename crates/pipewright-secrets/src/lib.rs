//! Pipewright Secrets
//!
//! Resolves the symbolic credential identifiers a pipeline declares (e.g.
//! `minio-access-key-id`, `mongo-user`) into values, all at once, at the
//! start of a run.
//!
//! Values live in a [`SecretSet`] for the lifetime of one run: they are
//! zeroed when the set is cleared or dropped, never printed by `Debug`, and
//! masked out of any text passed through [`SecretSet::redact`].

mod backend;
mod error;
mod resolver;
mod set;

pub use backend::{EnvBackend, FileBackend, MemoryBackend, SecretsBackend};
pub use error::SecretsError;
pub use resolver::SecretResolver;
pub use set::SecretSet;
