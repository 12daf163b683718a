//! Error types for bridge-router.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("frontmatter error at line {line}: {message}")]
    Frontmatter { line: usize, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
