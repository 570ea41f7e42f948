// src/error.rs
use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Startup-time errors (`Validation`, `UnknownSourceType`, `ConfigMismatch`)
/// propagate and abort process start. Runtime errors (`Fetch`, `Dispatch`,
/// `Backend`) are isolated at the loop or item that raised them.
#[derive(Debug, Error)]
pub enum FeederError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown source type '{requested}' (available: {available:?})")]
    UnknownSourceType {
        requested: String,
        available: Vec<String>,
    },

    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FeederError>;
