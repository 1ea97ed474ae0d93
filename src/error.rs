//! Domain error types for the block dispatcher.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return a [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for block-source fallible operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result alias for local output and temp-file fallible operations.
pub type OutputResult<T> = std::result::Result<T, OutputError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Indicates machines or command-line configuration failed to load.
    #[error("configuration failed")]
    Config(#[from] ConfigError),
    /// Indicates the block source failed to produce or recycle a block.
    #[error("block source failed")]
    Source(#[from] SourceError),
    /// Indicates local output or temp-file handling failed.
    #[error("local output failed")]
    Output(#[from] OutputError),
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

/// Captures block-source failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SourceError(#[from] Report);

/// Captures local output and temp-file failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct OutputError(#[from] Report);
