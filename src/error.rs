// src/error.rs
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("File error: {path:?} - {message}")]
    FileError {
        path: PathBuf,
        message: String,
    },

    #[error("External tool error: {tool} - {message}")]
    ExternalToolError {
        tool: String,
        message: String,
    },

    #[error("Remote API error: {service} - {message}")]
    ApiError {
        service: String,
        message: String,
    },

    #[error("Timeout error: {operation} exceeded {seconds} seconds")]
    TimeoutError {
        operation: String,
        seconds: u64,
    },

    #[error("Index error: {sink} - {message}")]
    IndexError {
        sink: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl From<anyhow::Error> for SurfaceError {
    fn from(error: anyhow::Error) -> Self {
        SurfaceError::UnexpectedError(error.to_string())
    }
}

impl From<reqwest::Error> for SurfaceError {
    fn from(error: reqwest::Error) -> Self {
        SurfaceError::NetworkError(error.to_string())
    }
}

impl From<serde_json::Error> for SurfaceError {
    fn from(error: serde_json::Error) -> Self {
        SurfaceError::SerializationError(error.to_string())
    }
}

impl From<std::io::Error> for SurfaceError {
    fn from(error: std::io::Error) -> Self {
        SurfaceError::UnexpectedError(format!("I/O error: {}", error))
    }
}

pub type SurfaceResult<T> = std::result::Result<T, SurfaceError>;
