//! CLI error type.

use thiserror::Error;

/// Errors surfaced to the terminal user.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("registry error: {0}")]
    Registry(#[from] modelvault::registry::RegistryError),

    #[error("{0}")]
    Metadata(#[from] modelvault::metadata::MetadataError),

    #[error("download error: {0}")]
    Download(#[from] modelvault::downloads::DownloadError),

    #[error("{0}")]
    Manager(#[from] modelvault::downloads::ManagerError),

    #[error("server error: {0}")]
    Serve(String),

    #[error("signal handler error: {0}")]
    Signal(String),
}
