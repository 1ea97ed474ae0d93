//! The atomic unit of dispatched work.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;

use crate::error::SourceResult;

/// One unit of work: a local input file plus a human-readable description.
///
/// A block is owned by the source until dispatched, then travels with the
/// worker's assignment for the duration of the attempt. On failure it returns
/// to the source's retry queue; on a successful fetch the source is notified
/// so it can release per-block resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    input: Utf8PathBuf,
    description: String,
}

impl Block {
    /// Creates a block backed by `input`.
    #[must_use]
    pub fn new(input: Utf8PathBuf, description: String) -> Self {
        Self { input, description }
    }

    /// Path of the local file holding the block's input bytes.
    #[must_use]
    pub fn input(&self) -> &Utf8Path {
        &self.input
    }

    /// Human-readable description, e.g. `lines [0,99]` or `file foo.txt`.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Size of the input file in bytes, queried on demand.
    pub fn size(&self) -> SourceResult<u64> {
        let meta = std::fs::metadata(self.input.as_std_path())
            .with_context(|| format!("stat block input {}", self.input))?;
        Ok(meta.len())
    }
}
