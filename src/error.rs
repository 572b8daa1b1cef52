//! CP-010: Error types for cookport.
//!
//! Only configuration and I/O problems are errors. Structural defects in
//! recipes are recovered by the extractor, unmapped resources are data, and
//! generator/gateway failures become session outcomes.

use std::path::PathBuf;

/// Top-level error enum for the library and CLI.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// ConfigurationFatal: surfaced before any session starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("mapping file {path}: {message}")]
    MappingFile { path: PathBuf, message: String },

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no cookbooks (metadata.rb) found under {0}")]
    NoCookbooks(PathBuf),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("validation gateway: {0}")]
    Gateway(String),

    #[error("{0} blocking diagnostic(s)")]
    Rejected(usize),

    #[error("{failed} of {total} conversion(s) failed")]
    SessionsFailed { failed: usize, total: usize },
}

impl ConvertError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

impl From<serde_yaml_ng::Error> for ConvertError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
