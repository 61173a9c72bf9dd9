//! Error types for configuration and client state files.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving paths or loading configuration.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The configuration is well-formed but unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The config file exists but is not valid JSON for [`Config`](crate::Config).
    #[error("Invalid config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured URL (Supabase or web app origin) does not parse.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The home directory could not be determined.
    #[error("Path error: {0}")]
    Path(String),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
