//! Artifact generation for compiled infrac descriptors

pub mod error;
pub mod orphans;
pub mod region;
pub mod render;
pub mod writer;

use std::path::Path;

use infrac_core::Compilation;

pub use error::WriteError;
pub use region::{ManagedFile, RegionError};
pub use render::{render, Artifact, ArtifactKind};
pub use writer::{ArtifactWriter, FileAction, WriteOptions, WritePlan};

/// Render a compilation and write it under `output`.
///
/// Every file is rendered and merged before the first write.
pub fn generate(
    compilation: &Compilation,
    output: &Path,
    options: WriteOptions,
) -> Result<WritePlan, WriteError> {
    let artifacts = render(compilation)?;
    ArtifactWriter::new(output, options).write(&artifacts)
}
