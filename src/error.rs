//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid rule set or configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by an external counter store
    #[error("Counter backend error: {0}")]
    Backend(String),

    /// Layered settings could not be loaded or deserialized
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse errors (replay input)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A replay record that could not be parsed
    #[error("Invalid record on line {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
