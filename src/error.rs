use thiserror::Error;

use crate::media::MediaError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Call already closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Short machine-readable kind, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Media(_) => "media",
            AppError::Negotiation(_) => "negotiation",
            AppError::Relay(_) => "relay",
            AppError::Transport(_) => "transport",
            AppError::Closed => "closed",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
