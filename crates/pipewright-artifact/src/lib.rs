//! Pipewright Artifact
//!
//! Packages a run's output directories into a single gzip-compressed tar
//! bundle. Bundles are deterministic: entries are sorted by path and every
//! header is normalised, so the same directory contents always produce the
//! same bytes and therefore the same `sha256:` digest.

mod error;
mod packager;

pub use error::PackageError;
pub use packager::{Artifact, ArtifactPackager};
