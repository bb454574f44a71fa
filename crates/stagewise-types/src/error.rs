// Configuration error type shared by every crate that loads a pipeline.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid pipeline config: {0}")]
    Invalid(String),

    #[error("stage {stage}: `{name}` is not one of the declared {list}")]
    UnknownName {
        stage: usize,
        name: String,
        list: &'static str,
    },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ConfigError>;
